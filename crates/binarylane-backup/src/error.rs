use std::fmt;

#[derive(Debug)]
pub struct Error {
    msg: String,
    status: Option<u16>,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self {
            msg: msg.into(),
            status: None,
        }
    }

    /// A failed remote API call: `"{action} [{status}]: {reason}"`.
    pub fn api(action: impl fmt::Display, status: u16, reason: impl fmt::Display) -> Self {
        Self {
            msg: format!("{action} [{status}]: {reason}"),
            status: Some(status),
        }
    }

    /// HTTP status of a failed API call, if this error came from one.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn is_api(&self) -> bool {
        self.status.is_some()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::msg(format!("json error: {err}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::msg(format!("http error: {err}"))
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
