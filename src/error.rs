//! The error type for the check controller

/// A single error type for everything this crate does
#[derive(Debug)]
pub enum Error {
    /// A generic error with a message
    Generic(String),
    /// An error from the k8s client
    K8s(kube::Error),
    /// An error loading configuration
    Config(config::ConfigError),
    /// An error (de)serializing a value with serde
    Serde(serde_json::Error),
    /// An error sending or receiving an HTTP request
    Reqwest(reqwest::Error),
    /// An IO error
    IO(std::io::Error),
    /// An error parsing a timestamp
    ChronoParse(chrono::ParseError),
    /// An error joining a tokio task
    JoinError(tokio::task::JoinError),
}

impl Error {
    /// Create a new generic error
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn new<T: Into<String>>(msg: T) -> Self {
        Error::Generic(msg.into())
    }

    /// Get the kind of error as a str, used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Generic(_) => "Generic",
            Error::K8s(_) => "K8s",
            Error::Config(_) => "Config",
            Error::Serde(_) => "Serde",
            Error::Reqwest(_) => "Reqwest",
            Error::IO(_) => "IO",
            Error::ChronoParse(_) => "ChronoParse",
            Error::JoinError(_) => "JoinError",
        }
    }

    /// `true` when this error is a k8s 409 Conflict, the expected response
    /// when a Job with our name already exists
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::K8s(kube::Error::Api(resp)) if resp.code == 409)
    }

    /// `true` when this error is a k8s 404 Not Found
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::K8s(kube::Error::Api(resp)) if resp.code == 404)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Generic(msg) => write!(f, "{msg}"),
            Error::K8s(err) => write!(f, "k8s error: {err}"),
            Error::Config(err) => write!(f, "config error: {err}"),
            Error::Serde(err) => write!(f, "serde error: {err}"),
            Error::Reqwest(err) => write!(f, "http error: {err}"),
            Error::IO(err) => write!(f, "io error: {err}"),
            Error::ChronoParse(err) => write!(f, "timestamp parse error: {err}"),
            Error::JoinError(err) => write!(f, "task join error: {err}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<kube::Error> for Error {
    fn from(error: kube::Error) -> Self {
        Error::K8s(error)
    }
}

impl From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Error::Config(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serde(error)
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Reqwest(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

impl From<chrono::ParseError> for Error {
    fn from(error: chrono::ParseError) -> Self {
        Error::ChronoParse(error)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(error: tokio::task::JoinError) -> Self {
        Error::JoinError(error)
    }
}
