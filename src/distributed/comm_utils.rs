//! Tensor-level helpers over the [`Communicator`] seam
//!
//! Messages carry raw `f32` payloads. The receiving side supplies the dims it
//! expects and a length mismatch is reported as a shape error naming the peer.

use super::comm::{CancelToken, Communicator, Tag, RESERVED_TAG_BASE};
use crate::error::{ForgeResult, RingForgeError};
use crate::tensor::Tensor;
use std::time::Duration;

fn check_user_tag(tag: Tag) -> ForgeResult<()> {
    if tag >= RESERVED_TAG_BASE {
        return Err(RingForgeError::InvalidConfiguration(format!(
            "tag {} is reserved for collectives",
            tag
        )));
    }
    Ok(())
}

/// Send a copy of `tensor` to `dest`
pub fn send_tensor(comm: &dyn Communicator, tensor: &Tensor, dest: usize, tag: Tag) -> ForgeResult<()> {
    check_user_tag(tag)?;
    comm.send(dest, tag, tensor.data().to_vec())
}

/// Receive a tensor of shape `dims` from `src`, stopping early if `cancel` is set
pub fn recv_tensor(
    comm: &dyn Communicator,
    src: usize,
    tag: Tag,
    dims: &[usize],
    timeout: Duration,
    cancel: Option<&CancelToken>,
) -> ForgeResult<Tensor> {
    check_user_tag(tag)?;
    let payload = match cancel {
        Some(cancel) => comm.recv_cancellable(src, tag, timeout, cancel)?,
        None => comm.recv(src, tag, timeout)?,
    };
    let expected: usize = dims.iter().product();
    if payload.len() != expected {
        return Err(RingForgeError::ShapeMismatch(format!(
            "rank {} received {} values from rank {} (tag {}), expected {:?}",
            comm.rank(),
            payload.len(),
            src,
            tag,
            dims
        )));
    }
    Tensor::from_vec(dims, payload)
}

/// Overwrite `tensor` on every rank with the root's values.
///
/// Non-root ranks keep their own shape and `requires_grad` flag; only the
/// values are replaced.
pub fn broadcast_tensor(
    comm: &dyn Communicator,
    tensor: &mut Tensor,
    root: usize,
    timeout: Duration,
) -> ForgeResult<()> {
    let mut payload = if comm.rank() == root {
        tensor.data().to_vec()
    } else {
        Vec::new()
    };
    comm.broadcast(&mut payload, root, timeout)?;

    if comm.rank() != root {
        if payload.len() != tensor.numel() {
            return Err(RingForgeError::ShapeMismatch(format!(
                "broadcast from rank {} carried {} values, local tensor {} holds {}",
                root,
                payload.len(),
                tensor.shape(),
                tensor.numel()
            )));
        }
        tensor.data_mut().copy_from_slice(&payload);
    }
    Ok(())
}
