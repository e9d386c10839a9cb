// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: dlcserviced byte-frame protocol (host-testable, side-effect free)
//! OWNERS: @runtime
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (host)
//!
//! ```text
//! request:  [D, L, ver=1, op, payload...]
//! response: [D, L, ver=1, op|0x80, status, payload...]
//! signal:   [D, L, ver=1, OP_STATE_CHANGED, state...]
//! str:      len:u16le, utf8 bytes
//! ids:      count:u16le, str*
//! state:    id:str, kind:u8, progress:f64le, error_code:str, root_path:str
//! states:   count:u16le, state*
//! ```
//!
//! An error response (`status != STATUS_OK`) carries `code:str, message:str`.
//! A request whose header is readable always gets a response, even when its
//! payload is not.
//!
//! INVARIANTS:
//! - Decoding is bounded and never panics on malformed input
//! - Trailing bytes after a payload are rejected

#![forbid(unsafe_code)]

use dlc::{DlcError, DlcId, DlcState, DlcStateKind, ErrorCode};
use thiserror::Error;

pub const MAGIC0: u8 = b'D';
pub const MAGIC1: u8 = b'L';
pub const VERSION: u8 = 1;

pub const OP_INSTALL: u8 = 1;
pub const OP_UNINSTALL: u8 = 2;
pub const OP_PURGE: u8 = 3;
pub const OP_GET_STATE: u8 = 4;
pub const OP_GET_INSTALLED: u8 = 5;
pub const OP_GET_EXISTING_DLCS: u8 = 6;
pub const OP_INSTALL_COMPLETED: u8 = 7;
pub const OP_UPDATE_COMPLETED: u8 = 8;
pub const OP_STATE_CHANGED: u8 = 0x40;

const RESPONSE_BIT: u8 = 0x80;

pub const STATUS_OK: u8 = 0;
pub const STATUS_ERROR: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame truncated")]
    Truncated,
    #[error("bad frame header")]
    BadHeader,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown opcode {0:#04x}")]
    UnknownOp(u8),
    #[error("response for opcode {got:#04x}, expected {expected:#04x}")]
    UnexpectedOp { expected: u8, got: u8 },
    #[error("invalid utf-8 in string field")]
    Utf8,
    #[error("invalid {0}")]
    InvalidField(&'static str),
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
    #[error("{0} exceeds the frame limit")]
    TooLarge(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Install { id: DlcId, omaha_url: String },
    Uninstall { id: DlcId },
    Purge { id: DlcId },
    GetState { id: DlcId },
    GetInstalled,
    GetExistingDlcs,
    InstallCompleted { ids: Vec<DlcId> },
    UpdateCompleted { ids: Vec<DlcId> },
}

impl Request {
    pub fn op(&self) -> u8 {
        match self {
            Self::Install { .. } => OP_INSTALL,
            Self::Uninstall { .. } => OP_UNINSTALL,
            Self::Purge { .. } => OP_PURGE,
            Self::GetState { .. } => OP_GET_STATE,
            Self::GetInstalled => OP_GET_INSTALLED,
            Self::GetExistingDlcs => OP_GET_EXISTING_DLCS,
            Self::InstallCompleted { .. } => OP_INSTALL_COMPLETED,
            Self::UpdateCompleted { .. } => OP_UPDATE_COMPLETED,
        }
    }
}

/// One entry of a `GetExistingDlcs` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingDlc {
    pub id: DlcId,
    pub name: String,
    pub description: String,
    pub used_bytes_on_disk: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Done,
    State(DlcState),
    States(Vec<DlcState>),
    Existing(Vec<ExistingDlc>),
}

fn header(op: u8) -> Vec<u8> {
    vec![MAGIC0, MAGIC1, VERSION, op]
}

fn put_str(out: &mut Vec<u8>, value: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len()).map_err(|_| ProtocolError::TooLarge("string"))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn put_ids(out: &mut Vec<u8>, ids: &[DlcId]) -> Result<(), ProtocolError> {
    let count = u16::try_from(ids.len()).map_err(|_| ProtocolError::TooLarge("id list"))?;
    out.extend_from_slice(&count.to_le_bytes());
    for id in ids {
        put_str(out, id)?;
    }
    Ok(())
}

fn put_states(out: &mut Vec<u8>, states: &[DlcState]) -> Result<(), ProtocolError> {
    let count = u16::try_from(states.len()).map_err(|_| ProtocolError::TooLarge("state list"))?;
    out.extend_from_slice(&count.to_le_bytes());
    for state in states {
        put_state(out, state)?;
    }
    Ok(())
}

fn put_state(out: &mut Vec<u8>, state: &DlcState) -> Result<(), ProtocolError> {
    put_str(out, &state.id)?;
    out.push(state.state.to_u8());
    out.extend_from_slice(&state.progress.to_le_bytes());
    put_str(out, state.last_error_code.as_str())?;
    put_str(out, &state.root_path)
}

pub fn encode_request(request: &Request) -> Result<Vec<u8>, ProtocolError> {
    let mut out = header(request.op());
    match request {
        Request::Install { id, omaha_url } => {
            put_str(&mut out, id)?;
            put_str(&mut out, omaha_url)?;
        }
        Request::Uninstall { id } | Request::Purge { id } | Request::GetState { id } => {
            put_str(&mut out, id)?;
        }
        Request::GetInstalled | Request::GetExistingDlcs => {}
        Request::InstallCompleted { ids } | Request::UpdateCompleted { ids } => {
            put_ids(&mut out, ids)?;
        }
    }
    Ok(out)
}

pub fn decode_request(frame: &[u8]) -> Result<Request, ProtocolError> {
    let (op, mut reader) = split_header(frame)?;
    let request = match op {
        OP_INSTALL => Request::Install { id: reader.str()?, omaha_url: reader.str()? },
        OP_UNINSTALL => Request::Uninstall { id: reader.str()? },
        OP_PURGE => Request::Purge { id: reader.str()? },
        OP_GET_STATE => Request::GetState { id: reader.str()? },
        OP_GET_INSTALLED => Request::GetInstalled,
        OP_GET_EXISTING_DLCS => Request::GetExistingDlcs,
        OP_INSTALL_COMPLETED => Request::InstallCompleted { ids: reader.ids()? },
        OP_UPDATE_COMPLETED => Request::UpdateCompleted { ids: reader.ids()? },
        other => return Err(ProtocolError::UnknownOp(other)),
    };
    reader.finish()?;
    Ok(request)
}

/// Opcode of a request frame whose header is valid, even if its payload is
/// not. Used to address an error reply to a request that failed to decode.
pub fn request_op(frame: &[u8]) -> Result<u8, ProtocolError> {
    split_header(frame).map(|(op, _)| op)
}

pub fn encode_response(
    op: u8,
    result: &Result<Response, DlcError>,
) -> Result<Vec<u8>, ProtocolError> {
    let mut out = header(op | RESPONSE_BIT);
    match result {
        Err(err) => {
            out.push(STATUS_ERROR);
            put_str(&mut out, err.code().as_str())?;
            put_str(&mut out, err.message())?;
        }
        Ok(response) => {
            out.push(STATUS_OK);
            match response {
                Response::Done => {}
                Response::State(state) => put_state(&mut out, state)?,
                Response::States(states) => put_states(&mut out, states)?,
                Response::Existing(dlcs) => {
                    let count =
                        u16::try_from(dlcs.len()).map_err(|_| ProtocolError::TooLarge("id list"))?;
                    out.extend_from_slice(&count.to_le_bytes());
                    for dlc in dlcs {
                        put_str(&mut out, &dlc.id)?;
                        put_str(&mut out, &dlc.name)?;
                        put_str(&mut out, &dlc.description)?;
                        out.extend_from_slice(&dlc.used_bytes_on_disk.to_le_bytes());
                    }
                }
            }
        }
    }
    Ok(out)
}

/// Decodes the reply to a request with opcode `expected_op`. The outer
/// error is a framing failure; the inner one is the service's answer.
pub fn decode_response(
    expected_op: u8,
    frame: &[u8],
) -> Result<Result<Response, DlcError>, ProtocolError> {
    let (op, mut reader) = split_header(frame)?;
    if op != expected_op | RESPONSE_BIT {
        return Err(ProtocolError::UnexpectedOp { expected: expected_op | RESPONSE_BIT, got: op });
    }
    let status = reader.u8()?;
    if status != STATUS_OK {
        let code = reader.str()?;
        let code = ErrorCode::parse(&code).ok_or(ProtocolError::InvalidField("error code"))?;
        let message = reader.str()?;
        reader.finish()?;
        return Ok(Err(DlcError::new(code, message)));
    }
    let response = match expected_op {
        OP_INSTALL | OP_UNINSTALL | OP_PURGE | OP_INSTALL_COMPLETED | OP_UPDATE_COMPLETED => {
            Response::Done
        }
        OP_GET_STATE => Response::State(reader.state()?),
        OP_GET_INSTALLED => {
            let count = reader.u16()?;
            let mut states = Vec::with_capacity(usize::from(count).min(256));
            for _ in 0..count {
                states.push(reader.state()?);
            }
            Response::States(states)
        }
        OP_GET_EXISTING_DLCS => {
            let count = reader.u16()?;
            let mut dlcs = Vec::with_capacity(usize::from(count).min(256));
            for _ in 0..count {
                dlcs.push(ExistingDlc {
                    id: reader.str()?,
                    name: reader.str()?,
                    description: reader.str()?,
                    used_bytes_on_disk: reader.u64()?,
                });
            }
            Response::Existing(dlcs)
        }
        other => return Err(ProtocolError::UnknownOp(other)),
    };
    reader.finish()?;
    Ok(Ok(response))
}

pub fn encode_state_changed(state: &DlcState) -> Result<Vec<u8>, ProtocolError> {
    let mut out = header(OP_STATE_CHANGED);
    put_state(&mut out, state)?;
    Ok(out)
}

pub fn decode_state_changed(frame: &[u8]) -> Result<DlcState, ProtocolError> {
    let (op, mut reader) = split_header(frame)?;
    if op != OP_STATE_CHANGED {
        return Err(ProtocolError::UnexpectedOp { expected: OP_STATE_CHANGED, got: op });
    }
    let state = reader.state()?;
    reader.finish()?;
    Ok(state)
}

/// True for server-initiated `DlcStateChanged` frames.
pub fn is_signal(frame: &[u8]) -> bool {
    frame.len() > 3 && frame[0] == MAGIC0 && frame[1] == MAGIC1 && frame[3] == OP_STATE_CHANGED
}

fn split_header(frame: &[u8]) -> Result<(u8, Reader<'_>), ProtocolError> {
    if frame.len() < 4 {
        return Err(ProtocolError::Truncated);
    }
    if frame[0] != MAGIC0 || frame[1] != MAGIC1 {
        return Err(ProtocolError::BadHeader);
    }
    if frame[2] != VERSION {
        return Err(ProtocolError::UnsupportedVersion(frame[2]));
    }
    Ok((frame[3], Reader { buf: &frame[4..] }))
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() < len {
            return Err(ProtocolError::Truncated);
        }
        let (head, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    fn str(&mut self) -> Result<String, ProtocolError> {
        let len = usize::from(self.u16()?);
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes).map(str::to_string).map_err(|_| ProtocolError::Utf8)
    }

    fn ids(&mut self) -> Result<Vec<DlcId>, ProtocolError> {
        let count = self.u16()?;
        let mut ids = Vec::with_capacity(usize::from(count).min(256));
        for _ in 0..count {
            ids.push(self.str()?);
        }
        Ok(ids)
    }

    fn state(&mut self) -> Result<DlcState, ProtocolError> {
        let id = self.str()?;
        let state =
            DlcStateKind::from_u8(self.u8()?).ok_or(ProtocolError::InvalidField("state"))?;
        let progress = self.f64()?;
        if !(0.0..=1.0).contains(&progress) {
            return Err(ProtocolError::InvalidField("progress"));
        }
        let code = self.str()?;
        let last_error_code =
            ErrorCode::parse(&code).ok_or(ProtocolError::InvalidField("error code"))?;
        let root_path = self.str()?;
        Ok(DlcState { id, state, progress, last_error_code, root_path })
    }

    fn finish(self) -> Result<(), ProtocolError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TrailingBytes(self.buf.len()))
        }
    }
}
