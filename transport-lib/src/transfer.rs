use tracing::{debug, error};

use crate::{
    api::{
        BufferSegment, InstanceId, RequestHandle, TransferConfig, TransferDescriptor,
        TransferRequest,
    },
    error::{Result, TransferFailure, TransferFailureKind, TransportError},
    provider::RdmaContext,
    retry::{AttemptError, CountingSleepRetry, RetryError},
};

/// Releases a native request handle when dropped.
struct RequestGuard<'a> {
    ctx: &'a dyn RdmaContext,
    handle: RequestHandle,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.ctx.release_request(self.handle);
    }
}

fn failure(
    request: &TransferRequest,
    kind: TransferFailureKind,
    status: Option<i32>,
    instance_id: Option<InstanceId>,
) -> AttemptError {
    AttemptError::Retryable(TransferFailure {
        kind,
        status,
        endpoint: request.remote_endpoint.clone(),
        instance_id,
        local_addr: request.local_addr,
        remote_addr: request.remote_addr,
        length: request.length,
    })
}

fn attempt(
    ctx: &dyn RdmaContext,
    request: &TransferRequest,
    timeout_ms: i32,
) -> std::result::Result<(), AttemptError> {
    let endpoint = &request.remote_endpoint;
    let instance_id = ctx
        .query_instance_id(endpoint.host(), endpoint.port())
        .map_err(|status| {
            failure(request, TransferFailureKind::InstanceLookup, Some(status), None)
        })?;

    let len = u32::try_from(request.length).map_err(|_| {
        AttemptError::NonRetryable(format!(
            "transfer length {} exceeds a single segment",
            request.length
        ))
    })?;
    let descriptor = TransferDescriptor {
        instance_id,
        opcode: request.opcode,
        remote_addr: request.remote_addr,
        segments: [BufferSegment { addr: request.local_addr, len }].into_iter().collect(),
    };
    let config = TransferConfig::with_timeout(timeout_ms);

    let Some(handle) = ctx.exec_transfer(&descriptor, &config) else {
        return Err(failure(
            request,
            TransferFailureKind::NullSubmission,
            None,
            Some(instance_id),
        ));
    };
    let guard = RequestGuard { ctx, handle };
    let status = ctx.request_status(guard.handle);
    drop(guard);
    if status != 0 {
        return Err(failure(
            request,
            TransferFailureKind::Completion,
            Some(status),
            Some(instance_id),
        ));
    }
    Ok(())
}

/// Runs one blocking transfer under `policy`.
pub(crate) fn execute(
    ctx: &dyn RdmaContext,
    request: &TransferRequest,
    timeout_ms: i32,
    policy: &CountingSleepRetry,
) -> Result<()> {
    let result = policy.run(|n| {
        debug!(attempt = n, opcode = ?request.opcode, remote = %request.remote_endpoint, "transfer attempt");
        attempt(ctx, request, timeout_ms)
    });
    match result {
        Ok(()) => Ok(()),
        Err(RetryError::Exhausted { attempts, last }) => {
            error!(attempts, error = %last, "transfer failed, retry budget exhausted");
            Err(TransportError::Transfer(last))
        }
        Err(RetryError::Aborted(reason)) => {
            error!(%reason, remote = %request.remote_endpoint, "transfer aborted");
            Err(TransportError::NonRetryable(reason))
        }
    }
}
