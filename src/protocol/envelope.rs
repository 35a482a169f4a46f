//! Job envelope wire format and the completion handshake.
//!
//! An envelope is sent as a sequence of frames, all from the same source:
//!
//! 1. command name (string)
//! 2. index count, then the index list
//! 3. variable count; per variable its name and payload byte length
//! 4. every payload on its own tag (`TAG_VARIABLE_BASE + position`), sent
//!    concurrently and awaited together
//!
//! Results come back through a three-step exchange so that a worker never
//! pushes a large payload at a master that is busy dispatching:
//!
//! ```text
//! worker -> master : done  (TAG_COMPLETION)
//! master -> worker : ack   (TAG_COMPLETION_ACK)
//! worker -> master : output envelope
//! ```

use super::types::*;
use crate::transport::{
    Communicator, MASTER_RANK, Rank, Request, TAG_COMPLETION, TAG_COMPLETION_ACK, TAG_CONTROL,
    TAG_VARIABLE_BASE, Tag, TransportError, communicator::decode_int,
};
use crate::value::Value;

use std::collections::BTreeMap;

const DONE_SIGNAL: u64 = 1;
const FINISH_ACK: u64 = 0;

/// Pollable "I'm done" signal from a worker running a dispatched job.
#[derive(Debug)]
pub struct CompletionHandle {
    request: Request<Vec<u8>>,
}

impl CompletionHandle {
    pub fn worker(&self) -> Rank {
        self.request.peer()
    }

    /// `None` while the worker is still busy.
    pub fn poll(&mut self) -> Option<Result<u64, TransportError>> {
        let worker = self.worker();
        self.request
            .poll()
            .map(|result| result.and_then(|bytes| decode_int(worker, &bytes)))
    }

    pub async fn wait(self) -> Result<u64, TransportError> {
        let worker = self.worker();
        let bytes = self.request.wait().await?;
        decode_int(worker, &bytes)
    }
}

/// Sends `job` to `worker` and returns the handle to poll for its completion.
///
/// Returns once every payload has left this process; the worker's
/// processing is not awaited.
pub async fn start_job(
    comm: &Communicator,
    worker: Rank,
    job: &Job,
) -> Result<CompletionHandle, TransportError> {
    tracing::debug!(
        "Sending job {} to node {} ({} indices, {} variables)",
        job.command,
        worker,
        job.indices.len(),
        job.variables.len()
    );
    send_envelope(comm, worker, &job.command, &job.indices, &job.variables).await?;

    Ok(CompletionHandle {
        request: comm.recv_async(worker, TAG_COMPLETION),
    })
}

/// Blocks until the next job envelope from `src` has fully arrived.
pub async fn receive_job(comm: &Communicator, src: Rank) -> Result<Job, TransportError> {
    let (command, indices, variables) = receive_envelope(comm, src).await?;
    Ok(Job {
        command,
        indices,
        variables,
        kinds: Default::default(),
    })
}

pub async fn send_output(
    comm: &Communicator,
    dest: Rank,
    output: &JobOutput,
) -> Result<(), TransportError> {
    send_envelope(comm, dest, &output.command, &output.indices, &output.variables).await
}

pub async fn receive_output(comm: &Communicator, src: Rank) -> Result<JobOutput, TransportError> {
    let (command, indices, variables) = receive_envelope(comm, src).await?;
    Ok(JobOutput {
        command,
        indices,
        variables,
    })
}

/// Worker side, step one of the handshake.
pub async fn signal_done(comm: &Communicator) -> Result<(), TransportError> {
    comm.send_int(MASTER_RANK, TAG_COMPLETION, DONE_SIGNAL).await
}

/// Worker side: blocks until the master is ready for the output.
pub async fn wait_for_ack(comm: &Communicator) -> Result<(), TransportError> {
    comm.recv_int(MASTER_RANK, TAG_COMPLETION_ACK).await.map(|_| ())
}

pub async fn send_ack(comm: &Communicator, worker: Rank) -> Result<(), TransportError> {
    comm.send_int(worker, TAG_COMPLETION_ACK, 1).await
}

/// Master side, after the done signal has been observed: acknowledge and
/// pull the output envelope.
pub async fn collect_output(
    comm: &Communicator,
    worker: Rank,
) -> Result<JobOutput, TransportError> {
    send_ack(comm, worker).await?;
    receive_output(comm, worker).await
}

/// Worker side: acknowledges the shutdown sentinel.
pub async fn acknowledge_finish(comm: &Communicator) -> Result<(), TransportError> {
    comm.send_int(MASTER_RANK, TAG_COMPLETION, FINISH_ACK).await
}

/// Master side: sends the shutdown sentinel; the handle resolves on the ack.
pub async fn send_finish(
    comm: &Communicator,
    worker: Rank,
) -> Result<CompletionHandle, TransportError> {
    start_job(comm, worker, &Job::new(FINISH_COMMAND)).await
}

/// Master side: asks a worker for its host identifier.
pub async fn request_identity(comm: &Communicator, worker: Rank) -> Result<String, TransportError> {
    let identify = Job::new(IDENTIFY_COMMAND);
    send_envelope(comm, worker, &identify.command, &identify.indices, &identify.variables).await?;
    comm.recv_string(worker).await
}

async fn send_envelope(
    comm: &Communicator,
    dest: Rank,
    command: &str,
    indices: &[Index],
    variables: &BTreeMap<String, Value>,
) -> Result<(), TransportError> {
    // Encode everything before the first frame leaves; a failure sends nothing.
    let mut encoded = Vec::with_capacity(variables.len());
    for (name, value) in variables {
        let bytes = value.to_bytes().map_err(|e| {
            TransportError::Local(format!("could not serialize variable {}: {}", name, e))
        })?;
        encoded.push((name, bytes));
    }

    comm.send_string(dest, command).await?;

    comm.send_int(dest, TAG_CONTROL, indices.len() as u64).await?;
    comm.send_indices(dest, TAG_CONTROL, indices).await?;

    comm.send_int(dest, TAG_CONTROL, encoded.len() as u64).await?;
    for (name, bytes) in &encoded {
        comm.send_string(dest, name).await?;
        comm.send_int(dest, TAG_CONTROL, bytes.len() as u64).await?;
    }

    // Payloads go out concurrently, one tag per variable position.
    let requests: Vec<_> = encoded
        .into_iter()
        .enumerate()
        .map(|(position, (_, bytes))| comm.send_async(dest, variable_tag(position), bytes))
        .collect();
    for request in requests {
        request.wait().await?;
    }

    Ok(())
}

async fn receive_envelope(
    comm: &Communicator,
    src: Rank,
) -> Result<(String, Vec<Index>, BTreeMap<String, Value>), TransportError> {
    let command = comm.recv_string(src).await?;

    let num_indices = comm.recv_int(src, TAG_CONTROL).await? as usize;
    let indices = comm.recv_indices(src, TAG_CONTROL).await?;
    if indices.len() != num_indices {
        return Err(TransportError::Codec {
            rank: src,
            reason: format!("announced {} indices, received {}", num_indices, indices.len()),
        });
    }

    let num_variables = comm.recv_int(src, TAG_CONTROL).await? as usize;
    let mut names = Vec::with_capacity(num_variables);
    let mut lengths = Vec::with_capacity(num_variables);
    for _ in 0..num_variables {
        let name = comm.recv_string(src).await?;
        let length = comm.recv_int(src, TAG_CONTROL).await? as usize;
        tracing::trace!("Expect variable: {} (length: {})", name, length);
        names.push(name);
        lengths.push(length);
    }

    let requests: Vec<_> = (0..num_variables)
        .map(|position| comm.recv_async(src, variable_tag(position)))
        .collect();

    let mut variables = BTreeMap::new();
    for ((name, length), request) in names.into_iter().zip(lengths).zip(requests) {
        let bytes = request.wait().await?;
        if bytes.len() != length {
            return Err(TransportError::Codec {
                rank: src,
                reason: format!(
                    "variable {} announced {} bytes, received {}",
                    name,
                    length,
                    bytes.len()
                ),
            });
        }
        let value = Value::from_bytes(&bytes).map_err(|e| TransportError::Codec {
            rank: src,
            reason: format!("variable {}: {}", name, e),
        })?;
        variables.insert(name, value);
    }

    Ok((command, indices, variables))
}

fn variable_tag(position: usize) -> Tag {
    TAG_VARIABLE_BASE + position as Tag
}
