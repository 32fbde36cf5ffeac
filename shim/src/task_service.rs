//! Translates the generated ttrpc `Task` trait into calls against `Shim`.
//! `Pause`/`Resume`/`Checkpoint`/`Pids`/`Stats`/`CloseIO`/`Update` keep
//! the trait's default "not implemented" body.

use std::convert::TryInto;
use std::process;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Error;
use ttrpc::TtrpcContext;

use crate::io::StdioPaths;
use crate::managed_process::ExitRecord;
use crate::protocols::shim::{
    ConnectRequest, ConnectResponse, CreateTaskRequest, CreateTaskResponse, DeleteRequest,
    DeleteResponse, Empty, ExecProcessRequest, KillRequest, ResizePtyRequest, ShutdownRequest,
    StartRequest, StartResponse, StateRequest, StateResponse, Timestamp, WaitRequest, WaitResponse,
};
use crate::protocols::shim_ttrpc::Task;
use crate::shim::{optional_path, Shim};

pub struct TaskService {
    shim: Arc<Shim>,
}

impl TaskService {
    pub fn new(shim: Arc<Shim>) -> Self {
        Self { shim }
    }
}

impl Task for TaskService {
    #[tracing::instrument(err, skip(self, _ctx), fields(id = request.id.as_str()))]
    fn create(
        &self,
        _ctx: &TtrpcContext,
        request: CreateTaskRequest,
    ) -> ttrpc::Result<CreateTaskResponse> {
        let stdio = StdioPaths {
            stdin: optional_path(&request.stdin),
            stdout: optional_path(&request.stdout),
            stderr: optional_path(&request.stderr),
            terminal: request.terminal,
        };

        let pid = self
            .shim
            .create(&request.id, request.bundle, &request.rootfs, stdio)
            .map_err(error_response)?;

        Ok(CreateTaskResponse { pid, ..Default::default() })
    }

    #[tracing::instrument(err, skip(self, _ctx), fields(id = request.id.as_str()))]
    fn start(&self, _ctx: &TtrpcContext, request: StartRequest) -> ttrpc::Result<StartResponse> {
        let pid = if request.exec_id.is_empty() {
            self.shim.start_primary().map_err(error_response)?
        } else {
            self.shim.start_exec(&request.exec_id).map_err(error_response)?
        };

        Ok(StartResponse { pid, ..Default::default() })
    }

    #[tracing::instrument(err, skip(self, _ctx), fields(id = request.id.as_str()))]
    fn exec(&self, _ctx: &TtrpcContext, request: ExecProcessRequest) -> ttrpc::Result<Empty> {
        let stdio = StdioPaths {
            stdin: optional_path(&request.stdin),
            stdout: optional_path(&request.stdout),
            stderr: optional_path(&request.stderr),
            terminal: request.terminal,
        };

        self.shim
            .exec(&request.exec_id, stdio, &request.spec)
            .map_err(error_response)?;

        Ok(Empty::default())
    }

    #[tracing::instrument(err, skip(self, _ctx), fields(id = request.id.as_str()))]
    fn kill(&self, _ctx: &TtrpcContext, request: KillRequest) -> ttrpc::Result<Empty> {
        self.shim
            .kill(&request.exec_id, request.signal as i32, request.all)
            .map_err(error_response)?;

        Ok(Empty::default())
    }

    #[tracing::instrument(err, skip(self, _ctx), fields(id = request.id.as_str()))]
    fn state(&self, _ctx: &TtrpcContext, request: StateRequest) -> ttrpc::Result<StateResponse> {
        let state = self.shim.state(&request.exec_id).map_err(error_response)?;
        let (exit_status, exited_at) = exit_fields(state.exit).map_err(error_response)?;

        Ok(StateResponse {
            id: self.shim.id().to_string(),
            exec_id: state.exec_id,
            pid: state.pid,
            status: state.status,
            stdin: state.stdio.stdin.map(path_string).unwrap_or_default(),
            stdout: state.stdio.stdout.map(path_string).unwrap_or_default(),
            stderr: state.stdio.stderr.map(path_string).unwrap_or_default(),
            terminal: state.stdio.terminal,
            exit_status,
            exited_at,
            bundle: path_string(state.bundle),
            ..Default::default()
        })
    }

    #[tracing::instrument(err, skip(self, _ctx), fields(id = request.id.as_str()))]
    fn resize_pty(&self, _ctx: &TtrpcContext, request: ResizePtyRequest) -> ttrpc::Result<Empty> {
        self.shim
            .resize_pty(&request.exec_id, request.width, request.height)
            .map_err(error_response)?;

        Ok(Empty::default())
    }

    #[tracing::instrument(err, skip(self, _ctx), fields(id = request.id.as_str()))]
    fn wait(&self, _ctx: &TtrpcContext, request: WaitRequest) -> ttrpc::Result<WaitResponse> {
        let record = self.shim.wait(&request.exec_id).map_err(error_response)?;
        let (exit_status, exited_at) = exit_fields(Some(record)).map_err(error_response)?;

        Ok(WaitResponse { exit_status, exited_at, ..Default::default() })
    }

    #[tracing::instrument(err, skip(self, _ctx), fields(id = request.id.as_str()))]
    fn delete(&self, _ctx: &TtrpcContext, request: DeleteRequest) -> ttrpc::Result<DeleteResponse> {
        let (pid, record) = self.shim.delete(&request.exec_id).map_err(error_response)?;
        let (exit_status, exited_at) = exit_fields(Some(record)).map_err(error_response)?;

        Ok(DeleteResponse { pid, exit_status, exited_at, ..Default::default() })
    }

    #[tracing::instrument(err, skip(self, _ctx), fields(id = request.id.as_str()))]
    fn cleanup(&self, _ctx: &TtrpcContext, request: DeleteRequest) -> ttrpc::Result<DeleteResponse> {
        self.shim.cleanup().map_err(error_response)?;
        let _ = request;

        Ok(DeleteResponse::default())
    }

    #[tracing::instrument(skip(self, _ctx))]
    fn connect(&self, _ctx: &TtrpcContext, _request: ConnectRequest) -> ttrpc::Result<ConnectResponse> {
        let pid = process::id();
        Ok(ConnectResponse { shim_pid: pid, task_pid: pid, ..Default::default() })
    }

    #[tracing::instrument(skip(self, _ctx))]
    fn shutdown(&self, _ctx: &TtrpcContext, _request: ShutdownRequest) -> ttrpc::Result<Empty> {
        self.shim.shutdown();
        Ok(Empty::default())
    }
}

fn path_string(path: std::path::PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

fn exit_fields(
    record: Option<ExitRecord>,
) -> Result<(u32, ::protobuf::SingularPtrField<Timestamp>), Error> {
    match record {
        Some(record) => Ok((
            record.exit_status,
            Some(system_time_to_timestamp(record.exited_at)?).into(),
        )),
        None => Ok((0, None.into())),
    }
}

fn error_response(err: Error) -> ttrpc::Error {
    let code = match err.downcast_ref::<state::RunjError>() {
        Some(state::RunjError::InvalidArgument(_)) => ttrpc::Code::INVALID_ARGUMENT,
        Some(state::RunjError::AlreadyExists(_)) => ttrpc::Code::ALREADY_EXISTS,
        Some(state::RunjError::NotFound(_)) => ttrpc::Code::NOT_FOUND,
        Some(state::RunjError::FailedPrecondition(_)) => ttrpc::Code::FAILED_PRECONDITION,
        Some(state::RunjError::Timeout(_)) => ttrpc::Code::DEADLINE_EXCEEDED,
        _ => ttrpc::Code::INTERNAL,
    };
    ttrpc::Error::RpcStatus(ttrpc::get_status(code, err.to_string()))
}

fn system_time_to_timestamp(time: SystemTime) -> Result<Timestamp, Error> {
    let duration = time.duration_since(UNIX_EPOCH)?;

    Ok(Timestamp {
        seconds: duration.as_secs().try_into()?,
        nanos: duration.subsec_nanos().try_into()?,
        ..Default::default()
    })
}
