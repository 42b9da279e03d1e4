use std::io;

use failure::Fail;

use crate::link::ResponseStatus;

#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "I/O error: {}", _0)]
    Io(#[cause] io::Error),
    #[fail(display = "reader reported {:?}", _0)]
    Communication(ResponseStatus),
    #[fail(display = "protocol error: {}", _0)]
    Protocol(String),
    #[fail(display = "configuration error: {}", _0)]
    Config(String),
    #[fail(display = "{}", _0)]
    Program(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

impl From<String> for Error {
    fn from(e: String) -> Error {
        Error::Program(e)
    }
}

impl From<serial::Error> for Error {
    fn from(e: serial::Error) -> Error {
        Error::Io(e.into())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Error {
        Error::Protocol(format!("malformed tag record: {}", e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Config(format!("invalid config file: {}", e))
    }
}

impl From<ResponseStatus> for Error {
    fn from(e: ResponseStatus) -> Error {
        match e {
            ResponseStatus::PoorCommunication => Error::Communication(e),
            ResponseStatus::NoTags => Error::Communication(e),
            ResponseStatus::TagError => Error::Communication(e),
            ResponseStatus::AntennaError => Error::Communication(e),

            ResponseStatus::WrongLength => Error::Program("Wrong command length".to_string()),
            ResponseStatus::IllegalCommand => Error::Program("Illegal command".to_string()),
            ResponseStatus::ParameterError => Error::Program("Parameter error".to_string()),

            other => Error::Program(format!("Invalid status response: {:?}", other)),
        }
    }
}
