//! Launcher wire protocol
//!
//! Used on two links, both Unix stream sockets:
//! - invoker ↔ booster (`booster-<tag>` socket), later invoker ← daemon once
//!   the booster hands the connection over
//! - booster → daemon (private report channel created at spawn)
//!
//! Length-prefixed binary messages:
//!
//! ```text
//! ┌────────────┬──────────────┬──────────────────────┐
//! │   Length   │  Message ID  │  Payload (bincode)   │
//! │  (4 bytes) │  (4 bytes)   │  (variable length)   │
//! └────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! File descriptors (the invoker's stdio, the handed-over invoker
//! connection) travel as SCM_RIGHTS on a one-byte carrier sent right after
//! the message they belong to.

use crate::booster::types::BoosterType;
use crate::error::RejectReason;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Maximum message size (10MB to prevent memory exhaustion)
const MAX_MESSAGE_SIZE: u32 = 10 * 1024 * 1024;

/// Bumped whenever `InvocationRequest` changes shape
pub const PROTOCOL_VERSION: u32 = 1;

/// Message ID counter type (unique per message for request/response correlation)
pub type MessageId = u32;

/// Message envelope containing all possible message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Invoker asks a booster to launch an application
    Invoke(InvocationRequest),
    /// Booster took the request and is becoming the application
    Accepted(Accepted),
    /// Booster refused the request and keeps its slot
    Rejected(Rejected),
    /// Single-instance owner was raised instead of launching
    Raised(Raised),
    /// Daemon relays the application's exit status
    ExitStatus(ExitStatus),
    /// Booster reports to the daemon that it has been consumed
    Handoff(Handoff),
}

/// Launch request (Invoker → Booster)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub version: u32,
    /// Application name as typed by the user (argv[0])
    pub app_name: String,
    /// Absolute path of the binary to launch
    pub target: String,
    /// Full argument vector including argv[0]
    pub args: Vec<String>,
    /// Environment the application runs with
    pub env: HashMap<String, String>,
    /// Working directory of the invoker
    pub working_dir: String,
    /// Scheduling priority of the invoker
    pub priority: i32,
    /// Launch at most one instance of this application
    pub single_instance: bool,
    pub booster_type: BoosterType,
}

/// Request accepted (Booster → Invoker)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accepted {
    /// Pid of the application (the former booster)
    pub pid: i32,
}

/// Request refused (Booster → Invoker)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejected {
    pub reason: RejectReason,
    pub message: String,
}

/// Existing instance raised (Booster → Invoker)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Raised {
    pub owner_pid: i32,
}

/// Application exit status (Daemon → Invoker)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Exit code when the application exited normally
    pub code: i32,
    /// Terminating signal when the application was killed
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Shell-style exit code (128 + signal for killed applications)
    pub fn exit_code(&self) -> i32 {
        match self.signal {
            Some(signal) => 128 + signal,
            None => self.code,
        }
    }
}

/// Booster consumed (Booster → Daemon), followed by the invoker connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    pub booster_type: BoosterType,
    pub pid: i32,
    pub app_name: String,
}

/// Encode a message into the wire format
///
/// Format: [4-byte length][4-byte message ID][bincode payload]
pub fn encode_message(message: &Message, message_id: MessageId) -> io::Result<Vec<u8>> {
    let payload = bincode::serialize(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let payload_len = payload.len() as u32;
    if payload_len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", payload_len),
        ));
    }

    let total_len = 8 + payload_len;
    let mut buffer = Vec::with_capacity(total_len as usize);

    // Length prefix covers message_id + payload
    buffer.extend_from_slice(&(payload_len + 4).to_le_bytes());
    buffer.extend_from_slice(&message_id.to_le_bytes());
    buffer.extend_from_slice(&payload);

    Ok(buffer)
}

/// Decode a message from the wire format
///
/// Returns (message, message_id)
pub fn decode_message<R: Read>(reader: &mut R) -> io::Result<(Message, MessageId)> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let payload_len = u32::from_le_bytes(len_bytes);

    if payload_len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Message length too small",
        ));
    }
    if payload_len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", payload_len),
        ));
    }

    let mut id_bytes = [0u8; 4];
    reader.read_exact(&mut id_bytes)?;
    let message_id = u32::from_le_bytes(id_bytes);

    let data_len = (payload_len - 4) as usize;
    let mut payload = vec![0u8; data_len];
    reader.read_exact(&mut payload)?;

    let message: Message = bincode::deserialize(&payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok((message, message_id))
}

/// Write a message to a stream
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &Message,
    message_id: MessageId,
) -> io::Result<()> {
    let bytes = encode_message(message, message_id)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read a message from a stream
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<(Message, MessageId)> {
    decode_message(reader)
}

// Unix FD passing helpers using SCM_RIGHTS

/// Send file descriptors over a Unix socket using SCM_RIGHTS
pub fn send_fds<S: AsRawFd>(socket: &S, fds: &[RawFd]) -> io::Result<()> {
    use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};

    // At least one byte of data must carry the control message
    let dummy_data = [0u8; 1];
    let iov = [std::io::IoSlice::new(&dummy_data)];

    let fds_msg = ControlMessage::ScmRights(fds);

    sendmsg::<()>(
        socket.as_raw_fd(),
        &iov,
        &[fds_msg],
        MsgFlags::empty(),
        None,
    )
    .map_err(io::Error::from)?;

    Ok(())
}

/// Receive file descriptors from a Unix socket using SCM_RIGHTS
///
/// Received descriptors are close-on-exec and owned by the caller.
pub fn recv_fds<S: AsRawFd>(socket: &S, max_fds: usize) -> io::Result<Vec<OwnedFd>> {
    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};

    let mut dummy_data = [0u8; 1];
    let mut iov = [std::io::IoSliceMut::new(&mut dummy_data)];

    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 16]);

    let msg = recvmsg::<()>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(io::Error::from)?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(received_fds) = cmsg {
            for fd in received_fds {
                // SAFETY: the kernel just installed this descriptor for us
                let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                if fds.len() < max_fds {
                    fds.push(owned);
                }
            }
        }
    }

    if msg.bytes == 0 && fds.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed the connection before sending descriptors",
        ));
    }

    Ok(fds)
}
