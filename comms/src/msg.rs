use std::{borrow::Cow, io};

use crate::{
    Deserialize, Serialize,
    specs::{
        round::{AssignmentHeader, ResultHeader},
        worker::RegisterSpec,
    },
};

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const ERR_KIND: Header = 0;
const CONTROL_KIND: Header = 1;
const ASSIGNMENT_KIND: Header = 2;
const RESULT_KIND: Header = 3;

/// The payload data for the `Data` variant of the `Msg` enum.
#[derive(Debug, PartialEq)]
pub enum Payload<'a> {
    Assignment {
        header: AssignmentHeader,
        model: &'a [u8],
    },
    Result {
        header: ResultHeader,
        model: &'a [u8],
    },
}

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Register(RegisterSpec),
    Heartbeat,
    Terminate,
    Disconnect,
}

/// The application layer message for the entire system.
#[derive(Debug, PartialEq)]
pub enum Msg<'a> {
    Control(Command),
    Data(Payload<'a>),
    Err(Cow<'a, str>),
}

impl Msg<'_> {
    /// A short name for the message's kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(Command::Register(_)) => "control/register",
            Msg::Control(Command::Heartbeat) => "control/heartbeat",
            Msg::Control(Command::Terminate) => "control/terminate",
            Msg::Control(Command::Disconnect) => "control/disconnect",
            Msg::Data(Payload::Assignment { .. }) => "data/assignment",
            Msg::Data(Payload::Result { .. }) => "data/result",
            Msg::Err(_) => "err",
        }
    }

    fn buf_is_too_small<T>(size: usize, needed: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {needed} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: Header) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind header {kind}"),
        ))
    }
}

/// Any json failure on the receiving side means the peer sent a malformed frame.
fn invalid_json(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Writes `header` as a length-prefixed json document.
fn write_data_header<H: serde::Serialize>(buf: &mut Vec<u8>, header: &H) -> io::Result<()> {
    let start = buf.len();
    buf.extend_from_slice(&[0; HEADER_SIZE]);
    serde_json::to_writer(&mut *buf, header)?;

    let len = (buf.len() - start - HEADER_SIZE) as Header;
    buf[start..start + HEADER_SIZE].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

/// Splits a data body into its json header and the raw model blob.
fn read_data_header<'a, H: serde::Deserialize<'a>>(rest: &'a [u8]) -> io::Result<(H, &'a [u8])> {
    let Some((len_buf, rest)) = rest.split_first_chunk::<HEADER_SIZE>() else {
        return Msg::buf_is_too_small(rest.len(), HEADER_SIZE);
    };

    let len = Header::from_be_bytes(*len_buf) as usize;
    if rest.len() < len {
        return Msg::buf_is_too_small(rest.len(), len);
    }

    let (header, model) = rest.split_at(len);
    let header = serde_json::from_slice(header).map_err(invalid_json)?;
    Ok((header, model))
}

impl<'a> Serialize<'a> for Msg<'a> {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&ERR_KIND.to_be_bytes());
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&CONTROL_KIND.to_be_bytes());
                serde_json::to_writer(buf, cmd)?;
                Ok(None)
            }
            Msg::Data(Payload::Assignment { header, model }) => {
                buf.extend_from_slice(&ASSIGNMENT_KIND.to_be_bytes());
                write_data_header(buf, header)?;
                Ok(Some(*model))
            }
            Msg::Data(Payload::Result { header, model }) => {
                buf.extend_from_slice(&RESULT_KIND.to_be_bytes());
                write_data_header(buf, header)?;
                Ok(Some(*model))
            }
        }
    }
}

impl<'a> Deserialize<'a> for Msg<'a> {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self> {
        let Some((kind_buf, rest)) = buf.split_first_chunk::<HEADER_SIZE>() else {
            return Self::buf_is_too_small(buf.len(), HEADER_SIZE);
        };

        match Header::from_be_bytes(*kind_buf) {
            ERR_KIND => {
                let string = std::str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(Cow::Borrowed(string)))
            }
            CONTROL_KIND => {
                let cmd = serde_json::from_slice(rest).map_err(invalid_json)?;
                Ok(Self::Control(cmd))
            }
            ASSIGNMENT_KIND => {
                let (header, model) = read_data_header(rest)?;
                Ok(Self::Data(Payload::Assignment { header, model }))
            }
            RESULT_KIND => {
                let (header, model) = read_data_header(rest)?;
                Ok(Self::Data(Payload::Result { header, model }))
            }
            kind => Self::invalid_kind(kind),
        }
    }
}
