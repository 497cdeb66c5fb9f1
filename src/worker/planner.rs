//! What to run for a stage.
//!
//! A [`CommandPlanner`] turns a claim into a list of [`Step`]s that the
//! [`StageExecutor`](crate::worker::StageExecutor) carries out inside the
//! job's directory. [`ToolchainPlanner`] knows the real SDSoC and SDAccel
//! flows; tests substitute their own planner.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ToolchainSettings;
use crate::error::{PipelineError, Result};
use crate::ipc::ClaimOrder;
use crate::pipeline::{F1Mode, JobOptions, Stage, Toolchain};
use crate::store::{ARCHIVE_NAME, CODE_DIR};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// stdout and stderr go to the job log.
    Log,
    /// stdout is kept for the executor, stderr goes to the job log.
    Capture,
    /// Like `Capture`, then parsed for make variables and reported.
    MakeConf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    /// Relative to the job root.
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
    pub output: OutputMode,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: PathBuf::new(),
            env: Vec::new(),
            output: OutputMode::Log,
        }
    }

    /// `sh -c <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new(["sh".to_string(), "-c".to_string(), script.into()])
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = dir.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    /// Shell-quoted rendering for the job log.
    pub fn display(&self) -> String {
        let env = self
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, shell_quote(v)));
        let args = self.argv.iter().map(|a| shell_quote(a));
        env.chain(args).collect::<Vec<_>>().join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Run(CommandSpec),
    /// If the directory holds exactly one subdirectory, move that
    /// subdirectory's contents up a level.
    CollapseSingleDirectory(PathBuf),
    Sleep(Duration),
    /// Wait for the AFI named in `<xclbin_dir>/*afi_id.txt` to become available.
    AwaitAfi {
        xclbin_dir: PathBuf,
        poll_interval: Duration,
    },
}

pub trait CommandPlanner: Send + Sync {
    fn plan(&self, order: &ClaimOrder) -> Result<Vec<Step>>;
}

/// Planner for the SDSoC (Zynq) and SDAccel (AWS F1) flows.
#[derive(Debug, Clone, Default)]
pub struct ToolchainPlanner {
    settings: ToolchainSettings,
}

impl ToolchainPlanner {
    pub fn new(settings: ToolchainSettings) -> Self {
        Self { settings }
    }

    /// A toolchain invocation with the configured prefix applied.
    fn tool<I, S>(&self, argv: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(
            self.settings
                .command_prefix
                .iter()
                .cloned()
                .chain(argv.into_iter().map(Into::into)),
        )
    }

    fn unpack(&self) -> Vec<Step> {
        vec![
            Step::Run(CommandSpec::new(["unzip", "-o", "-q", "-d", CODE_DIR, ARCHIVE_NAME])),
            Step::CollapseSingleDirectory(PathBuf::from(CODE_DIR)),
        ]
    }

    fn make(&self, toolchain: Toolchain, options: &JobOptions, estimate: bool) -> Result<Vec<Step>> {
        let mut vars = match toolchain {
            Toolchain::Sdsoc => vec![
                format!("ESTIMATE={}", u8::from(estimate)),
                format!("PLATFORM={}", self.platform(options)),
                format!("TARGET={}", self.settings.executable_name),
            ],
            Toolchain::F1 => vec![
                format!("MODE={}", f1_mode(options)),
                format!("DEVICE={}", self.f1_device()?),
            ],
        };
        if let Some(directives) = &options.directives {
            vars.push(format!("DIRECTIVES={}", directives));
        }

        let make = self
            .tool(std::iter::once("make".to_string()).chain(vars))
            .in_dir(CODE_DIR);
        let dry_run = make
            .clone()
            .arg("--dry-run")
            .arg("--print-data-base")
            .output(OutputMode::MakeConf);
        Ok(vec![Step::Run(dry_run), Step::Run(make)])
    }

    fn builtin_synthesis(
        &self,
        order: &ClaimOrder,
        options: &JobOptions,
        estimate: bool,
    ) -> Result<Vec<Step>> {
        let hwname = options.hwname.as_deref().ok_or_else(|| {
            PipelineError::InvalidConfig("hwname is required for the built-in build".to_string())
        })?;
        let sources = find_sources(&order.file_root.join(CODE_DIR))?;
        let hw_source = sources
            .iter()
            .find(|s| Path::new(s).file_stem().is_some_and(|stem| stem == hwname))
            .unwrap_or(&sources[0])
            .clone();
        let exe = self.settings.executable_name.as_str();

        match order.toolchain {
            Toolchain::Sdsoc => {
                let mut argv = vec![
                    "sds++".to_string(),
                    "-sds-pf".to_string(),
                    self.platform(options),
                    "-sds-hw".to_string(),
                    hwname.to_string(),
                    hw_source,
                    "-sds-end".to_string(),
                ];
                if estimate {
                    argv.push("-perf-est-hw-only".to_string());
                }
                argv.extend(["-O3".to_string(), "-o".to_string(), exe.to_string()]);
                argv.extend(sources);
                Ok(vec![Step::Run(self.tool(argv).in_dir(CODE_DIR))])
            }
            Toolchain::F1 => {
                let mode = f1_mode(options).as_str();
                let device = self.f1_device()?;
                let xo = format!("xclbin/{}.{}.xo", hwname, mode);
                let xclbin = format!("xclbin/{}.{}.xclbin", hwname, mode);

                let mut steps = vec![Step::Run(
                    CommandSpec::new(["mkdir", "-p", "xclbin"]).in_dir(CODE_DIR),
                )];
                let mut compile = vec![
                    "xocc", "-t", mode, "--platform", device.as_str(), "-c", "-k", hwname,
                ]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>();
                if estimate {
                    compile.extend(["--report".to_string(), "estimate".to_string()]);
                }
                compile.extend(["-o".to_string(), xo.clone(), hw_source.clone()]);
                steps.push(Step::Run(self.tool(compile).in_dir(CODE_DIR)));
                if estimate {
                    return Ok(steps);
                }

                steps.push(Step::Run(
                    self.tool([
                        "xocc", "-t", mode, "--platform", device.as_str(), "-l", "-o", xclbin.as_str(), xo.as_str(),
                    ])
                    .in_dir(CODE_DIR),
                ));

                let host: Vec<String> = sources.into_iter().filter(|s| *s != hw_source).collect();
                if host.is_empty() {
                    return Err(PipelineError::InvalidConfig(format!(
                        "no host sources besides {}",
                        hw_source
                    )));
                }
                let mut link = vec!["g++", "-std=c++14", "-O2", "-o", exe]
                    .into_iter()
                    .map(String::from)
                    .collect::<Vec<_>>();
                link.extend(host);
                link.extend(["-lOpenCL", "-lpthread", "-lrt"].map(String::from));
                steps.push(Step::Run(self.tool(link).in_dir(CODE_DIR)));
                Ok(steps)
            }
        }
    }

    fn afi(&self) -> Vec<Step> {
        let xclbin_dir = Path::new(CODE_DIR).join("xclbin");
        let create = format!(
            "\"$SDACCEL_DIR/tools/create_sdaccel_afi.sh\" -xclbin=\"$(ls *hw.*xclbin | head -n 1)\" \
             -s3_bucket={} -s3_dcp_key={} -s3_logs_key={}",
            shell_quote(&self.settings.s3_bucket),
            shell_quote(&self.settings.s3_dcp_key),
            shell_quote(&self.settings.s3_logs_key),
        );
        vec![
            Step::Run(
                CommandSpec::shell("rm -rf to_aws *afi_id.txt *.tar *agfi_id.txt manifest.txt")
                    .in_dir(&xclbin_dir),
            ),
            Step::Run(CommandSpec::shell(create).in_dir(&xclbin_dir)),
            Step::AwaitAfi {
                xclbin_dir,
                poll_interval: Duration::from_secs(self.settings.afi_check_interval_secs),
            },
        ]
    }

    fn execute(&self, order: &ClaimOrder, options: &JobOptions) -> Result<Vec<Step>> {
        let exe = &self.settings.executable_name;
        match order.toolchain {
            Toolchain::Sdsoc => {
                let sd_card = Path::new(CODE_DIR).join("sd_card");
                let mut entries: Vec<String> = fs::read_dir(order.file_root.join(&sd_card))
                    .map_err(|e| {
                        PipelineError::InvalidConfig(format!("no sd_card output to deploy: {}", e))
                    })?
                    .filter_map(|entry| entry.ok())
                    .map(|entry| sd_card.join(entry.file_name()).to_string_lossy().into_owned())
                    .collect();
                entries.sort();

                let host = &self.settings.zynq_host;
                let ssh = |tail: Vec<String>| {
                    CommandSpec::new(self.settings.zynq_ssh_prefix.iter().cloned().chain(tail))
                };
                let mut scp = vec!["scp".to_string(), "-r".to_string()];
                scp.extend(entries);
                scp.push(format!("{}:{}", host, self.settings.zynq_dest_dir));

                Ok(vec![
                    Step::Run(ssh(scp)),
                    Step::Run(ssh(vec!["ssh".into(), host.clone(), "/sbin/reboot".into()])),
                    Step::Sleep(Duration::from_secs(self.settings.zynq_reboot_delay_secs)),
                    Step::Run(ssh(vec![
                        "ssh".into(),
                        host.clone(),
                        format!("cd {}; ./{}", self.settings.zynq_dest_dir, exe),
                    ])),
                ])
            }
            Toolchain::F1 => {
                let run = match f1_mode(options) {
                    F1Mode::Hw => CommandSpec::new([
                        "sudo".to_string(),
                        "sh".to_string(),
                        "-c".to_string(),
                        format!(". /opt/xilinx/xrt/setup.sh; ./{}", exe),
                    ]),
                    mode => CommandSpec::new([format!("./{}", exe)])
                        .env("XCL_EMULATION_MODE", mode.as_str()),
                };
                Ok(vec![Step::Run(run.in_dir(CODE_DIR))])
            }
        }
    }

    fn platform(&self, options: &JobOptions) -> String {
        options
            .platform
            .clone()
            .unwrap_or_else(|| self.settings.default_platform.clone())
    }

    fn f1_device(&self) -> Result<String> {
        match self.settings.f1_device.strip_prefix('$') {
            Some(var) => std::env::var(var).map_err(|_| {
                PipelineError::InvalidConfig(format!(
                    "environment variable {} is not set on this worker",
                    var
                ))
            }),
            None => Ok(self.settings.f1_device.clone()),
        }
    }
}

impl CommandPlanner for ToolchainPlanner {
    fn plan(&self, order: &ClaimOrder) -> Result<Vec<Step>> {
        let options = JobOptions::parse(order.toolchain, &order.config, F1Mode::SwEmu)?;
        match order.stage {
            Stage::Unpack => Ok(self.unpack()),
            Stage::Synthesize | Stage::Estimate => {
                let estimate = order.stage == Stage::Estimate;
                if options.make {
                    self.make(order.toolchain, &options, estimate)
                } else {
                    self.builtin_synthesis(order, &options, estimate)
                }
            }
            Stage::Afi => Ok(self.afi()),
            Stage::Execute => self.execute(order, &options),
        }
    }
}

fn f1_mode(options: &JobOptions) -> F1Mode {
    options.mode.unwrap_or(F1Mode::SwEmu)
}

/// C and C++ sources directly under `code_dir`, sorted by name.
fn find_sources(code_dir: &Path) -> Result<Vec<String>> {
    let mut sources: Vec<String> = fs::read_dir(code_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| {
            Path::new(name)
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| matches!(ext, "c" | "cc" | "cpp" | "cxx"))
        })
        .collect();
    if sources.is_empty() {
        return Err(PipelineError::InvalidConfig(format!(
            "no C/C++ sources found in {}",
            code_dir.display()
        )));
    }
    sources.sort();
    Ok(sources)
}

/// Extract `NAME = value` / `NAME := value` assignments for the given
/// variable names (case-insensitive) from make's database dump. Later
/// assignments win.
pub fn parse_make_conf(output: &str, vars: &[String]) -> BTreeMap<String, String> {
    let mut conf = BTreeMap::new();
    for line in output.lines() {
        let Some((lhs, value)) = line.trim().split_once('=') else {
            continue;
        };
        let lhs = lhs.trim_end();
        let name = lhs.strip_suffix(':').unwrap_or(lhs).trim_end();
        if vars.iter().any(|v| v.eq_ignore_ascii_case(name)) {
            conf.insert(name.to_string(), value.trim().to_string());
        }
    }
    conf
}

/// POSIX shell quoting for log display and generated scripts.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::ClaimToken;
    use crate::store::JobId;

    fn order(toolchain: Toolchain, stage: Stage, config: &[(&str, &str)], root: &Path) -> ClaimOrder {
        ClaimOrder {
            claim: ClaimToken::new(),
            job_id: JobId::from("abc"),
            name: "demo".to_string(),
            stage,
            toolchain,
            config: config
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            file_root: root.to_path_buf(),
        }
    }

    fn runs(steps: &[Step]) -> Vec<&CommandSpec> {
        steps
            .iter()
            .filter_map(|s| match s {
                Step::Run(spec) => Some(spec),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn quoting_leaves_plain_words_alone() {
        assert_eq!(shell_quote("make"), "make");
        assert_eq!(shell_quote("PLATFORM=zed"), "PLATFORM=zed");
        assert_eq!(shell_quote("cd /mnt; ./x"), "'cd /mnt; ./x'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn make_conf_matches_assignments_only() {
        let dump = "\
# variables
PLATFORM := zed
target = bench
ESTIMATE ?= 0
  MODE=hw_emu
OTHER = 1
PLATFORM = zc706
";
        let vars: Vec<String> = ["PLATFORM", "TARGET", "MODE", "ESTIMATE"]
            .into_iter()
            .map(String::from)
            .collect();
        let conf = parse_make_conf(dump, &vars);
        assert_eq!(conf.get("PLATFORM").map(String::as_str), Some("zc706"));
        assert_eq!(conf.get("target").map(String::as_str), Some("bench"));
        assert_eq!(conf.get("MODE").map(String::as_str), Some("hw_emu"));
        assert!(!conf.contains_key("ESTIMATE"));
        assert!(!conf.contains_key("OTHER"));
    }

    #[test]
    fn sdsoc_make_injects_variables_after_prefix() {
        let settings = ToolchainSettings {
            command_prefix: vec!["nice".to_string()],
            ..ToolchainSettings::default()
        };
        let planner = ToolchainPlanner::new(settings);
        let o = order(
            Toolchain::Sdsoc,
            Stage::Estimate,
            &[("make", "1"), ("estimate", "1"), ("directives", "d.tcl")],
            Path::new("/tmp/job"),
        );
        let steps = planner.plan(&o).unwrap();
        let specs = runs(&steps);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].output, OutputMode::MakeConf);
        assert!(specs[0].argv.ends_with(&["--dry-run".to_string(), "--print-data-base".to_string()]));
        assert_eq!(
            specs[1].argv,
            vec!["nice", "make", "ESTIMATE=1", "PLATFORM=zed", "TARGET=sdsoc", "DIRECTIVES=d.tcl"]
        );
        assert_eq!(specs[1].cwd, PathBuf::from("code"));
    }

    #[test]
    fn f1_make_uses_literal_device() {
        let settings = ToolchainSettings {
            f1_device: "xilinx_aws-vu9p".to_string(),
            ..ToolchainSettings::default()
        };
        let planner = ToolchainPlanner::new(settings);
        let o = order(
            Toolchain::F1,
            Stage::Synthesize,
            &[("make", "1"), ("mode", "hw")],
            Path::new("/tmp/job"),
        );
        let steps = planner.plan(&o).unwrap();
        assert_eq!(
            runs(&steps)[1].argv,
            vec!["make", "MODE=hw", "DEVICE=xilinx_aws-vu9p"]
        );
    }

    #[test]
    fn unpack_then_collapse() {
        let planner = ToolchainPlanner::default();
        let o = order(Toolchain::Sdsoc, Stage::Unpack, &[("hwname", "mm")], Path::new("/j"));
        let steps = planner.plan(&o).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1], Step::CollapseSingleDirectory(PathBuf::from("code")));
    }

    #[test]
    fn builtin_sdsoc_picks_hardware_source_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let code = dir.path().join(CODE_DIR);
        fs::create_dir_all(&code).unwrap();
        for name in ["main.cpp", "mmult.cpp", "notes.txt"] {
            fs::write(code.join(name), "").unwrap();
        }
        let planner = ToolchainPlanner::default();
        let o = order(
            Toolchain::Sdsoc,
            Stage::Estimate,
            &[("hwname", "mmult"), ("estimate", "1")],
            dir.path(),
        );
        let steps = planner.plan(&o).unwrap();
        let argv = &runs(&steps)[0].argv;
        assert_eq!(&argv[..7], &["sds++", "-sds-pf", "zed", "-sds-hw", "mmult", "mmult.cpp", "-sds-end"]);
        assert!(argv.contains(&"-perf-est-hw-only".to_string()));
        assert!(argv.ends_with(&["main.cpp".to_string(), "mmult.cpp".to_string()]));
    }

    #[test]
    fn builtin_without_sources_cannot_be_planned() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(CODE_DIR)).unwrap();
        let o = order(Toolchain::Sdsoc, Stage::Synthesize, &[("hwname", "mm")], dir.path());
        assert!(ToolchainPlanner::default().plan(&o).is_err());
    }

    #[test]
    fn f1_emulation_sets_mode_in_environment() {
        let planner = ToolchainPlanner::default();
        let o = order(
            Toolchain::F1,
            Stage::Execute,
            &[("hwname", "vadd"), ("mode", "hw_emu")],
            Path::new("/j"),
        );
        let steps = planner.plan(&o).unwrap();
        let spec = runs(&steps)[0];
        assert_eq!(spec.argv, vec!["./sdsoc"]);
        assert_eq!(spec.env, vec![("XCL_EMULATION_MODE".to_string(), "hw_emu".to_string())]);
        assert_eq!(spec.display(), "XCL_EMULATION_MODE=hw_emu ./sdsoc");
    }

    #[test]
    fn zynq_execution_copies_reboots_and_runs() {
        let dir = tempfile::tempdir().unwrap();
        let sd_card = dir.path().join(CODE_DIR).join("sd_card");
        fs::create_dir_all(&sd_card).unwrap();
        fs::write(sd_card.join("BOOT.BIN"), "").unwrap();
        fs::write(sd_card.join("sdsoc"), "").unwrap();

        let planner = ToolchainPlanner::default();
        let o = order(Toolchain::Sdsoc, Stage::Execute, &[("hwname", "mm")], dir.path());
        let steps = planner.plan(&o).unwrap();
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[2], Step::Sleep(Duration::from_secs(40)));
        let specs = runs(&steps);
        assert_eq!(
            specs[0].argv,
            vec![
                "sshpass", "-p", "root", "scp", "-r",
                "code/sd_card/BOOT.BIN", "code/sd_card/sdsoc", "zb1:/mnt"
            ]
        );
        assert_eq!(specs[2].argv.last().unwrap(), "cd /mnt; ./sdsoc");
    }
}
