use std::path::PathBuf;

use tonic::{Request, Response, Status};

use crate::grpc::convert::{job_to_proto, worker_to_proto};
use crate::pipeline::Toolchain;
use crate::proto::pipeline_service_server::PipelineService;
use crate::proto::{
    DeleteJobRequest, DeleteJobResponse, GetJobRequest, JobInfo, ListFilesRequest,
    ListFilesResponse, ListJobsRequest, ListJobsResponse, ListWorkersRequest, ListWorkersResponse,
    SetJobFieldRequest, SetJobFieldResponse, SetJobStateRequest, SetJobStateResponse,
    SubmitJobRequest, SubmitJobResponse,
};
use crate::scheduler::{SchedulerHandle, SubmitRequest};
use crate::store::{FileTree, JobId, JobState};

/// Client-facing job API.
pub struct PipelineApi {
    scheduler: SchedulerHandle,
}

impl PipelineApi {
    pub fn new(scheduler: SchedulerHandle) -> Self {
        Self { scheduler }
    }
}

fn file_tree(archive_path: String, source_dir: String) -> Result<FileTree, Status> {
    match (archive_path.is_empty(), source_dir.is_empty()) {
        (true, true) => Ok(FileTree::Empty),
        (false, true) => Ok(FileTree::Archive(PathBuf::from(archive_path))),
        (true, false) => Ok(FileTree::Directory(PathBuf::from(source_dir))),
        (false, false) => Err(Status::invalid_argument(
            "Give either an archive or a source directory, not both",
        )),
    }
}

fn job_id(raw: String) -> Result<JobId, Status> {
    if raw.is_empty() {
        return Err(Status::invalid_argument("Job ID cannot be empty"));
    }
    Ok(JobId::from(raw))
}

#[tonic::async_trait]
impl PipelineService for PipelineApi {
    async fn submit_job(
        &self,
        request: Request<SubmitJobRequest>,
    ) -> Result<Response<SubmitJobResponse>, Status> {
        let req = request.into_inner();
        let toolchain: Toolchain = req.toolchain.parse()?;
        let files = file_tree(req.archive_path, req.source_dir)?;

        let job_id = self
            .scheduler
            .submit(SubmitRequest {
                name: req.name,
                toolchain,
                config: req.config.into_iter().collect(),
                files,
            })
            .await?;
        let job = self.scheduler.get_job(&job_id).await?;

        tracing::info!(job_id = %job_id, toolchain = %toolchain, "Job submitted");
        Ok(Response::new(SubmitJobResponse {
            job_id: job_id.to_string(),
            started_ms: job.started.timestamp_millis(),
        }))
    }

    async fn get_job(&self, request: Request<GetJobRequest>) -> Result<Response<JobInfo>, Status> {
        let job_id = job_id(request.into_inner().job_id)?;
        let job = self.scheduler.get_job(&job_id).await?;
        Ok(Response::new(job_to_proto(&job)))
    }

    async fn list_jobs(
        &self,
        _request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        let jobs = self.scheduler.list_jobs().await;
        Ok(Response::new(ListJobsResponse {
            jobs: jobs.iter().map(job_to_proto).collect(),
        }))
    }

    async fn set_job_state(
        &self,
        request: Request<SetJobStateRequest>,
    ) -> Result<Response<SetJobStateResponse>, Status> {
        let req = request.into_inner();
        let job_id = job_id(req.job_id)?;
        let state: JobState = req
            .state
            .parse()
            .map_err(|e: crate::error::PipelineError| Status::invalid_argument(e.to_string()))?;
        let state = self.scheduler.set_state(&job_id, state).await?;
        Ok(Response::new(SetJobStateResponse {
            state: state.to_string(),
        }))
    }

    async fn set_job_field(
        &self,
        request: Request<SetJobFieldRequest>,
    ) -> Result<Response<SetJobFieldResponse>, Status> {
        let req = request.into_inner();
        let job_id = job_id(req.job_id)?;
        if req.key.is_empty() {
            return Err(Status::invalid_argument("Field name cannot be empty"));
        }
        self.scheduler
            .set_config_field(&job_id, &req.key, &req.value)
            .await?;
        Ok(Response::new(SetJobFieldResponse {}))
    }

    async fn delete_job(
        &self,
        request: Request<DeleteJobRequest>,
    ) -> Result<Response<DeleteJobResponse>, Status> {
        let job_id = job_id(request.into_inner().job_id)?;
        self.scheduler.delete_job(&job_id).await?;
        Ok(Response::new(DeleteJobResponse {}))
    }

    async fn list_files(
        &self,
        request: Request<ListFilesRequest>,
    ) -> Result<Response<ListFilesResponse>, Status> {
        let job_id = job_id(request.into_inner().job_id)?;
        let paths = self.scheduler.list_files(&job_id).await?;
        Ok(Response::new(ListFilesResponse { paths }))
    }

    async fn list_workers(
        &self,
        _request: Request<ListWorkersRequest>,
    ) -> Result<Response<ListWorkersResponse>, Status> {
        let workers = self.scheduler.list_workers().await?;
        Ok(Response::new(ListWorkersResponse {
            workers: workers.iter().map(worker_to_proto).collect(),
        }))
    }
}
