use std::fmt::{Display, Formatter};

/// A request sent by a client to the server, one per datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Echo(String),
    Time,
    Upload { filename: String, offset: u64 },
    Download { filename: String, offset: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommandParseError {
    #[error("Empty command")]
    Empty,
    #[error("Unknown command '{0}'")]
    Unknown(String),
    #[error("Filename required for {0}")]
    MissingFilename(&'static str),
}

impl Command {
    pub const ECHO: &'static str = "ECHO";
    pub const TIME: &'static str = "TIME";
    pub const UPLOAD: &'static str = "UPLOAD";
    pub const DOWNLOAD: &'static str = "DOWNLOAD";

    /// Parses a command line. The keyword is case-insensitive. For UPLOAD and DOWNLOAD, a
    ///  trailing numeric token is the resume offset if there is a filename before it, so
    ///  filenames may contain spaces.
    pub fn parse(line: &str) -> Result<Command, CommandParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(CommandParseError::Empty);
        }

        let (keyword, param) = match line.split_once(char::is_whitespace) {
            Some((keyword, param)) => (keyword, param.trim()),
            None => (line, ""),
        };

        match keyword.to_ascii_uppercase().as_str() {
            Self::ECHO => Ok(Command::Echo(param.to_string())),
            Self::TIME => Ok(Command::Time),
            Self::UPLOAD => {
                let (filename, offset) = Self::parse_file_param(param, "upload")?;
                Ok(Command::Upload { filename, offset })
            }
            Self::DOWNLOAD => {
                let (filename, offset) = Self::parse_file_param(param, "download")?;
                Ok(Command::Download { filename, offset })
            }
            other => Err(CommandParseError::Unknown(other.to_string())),
        }
    }

    fn parse_file_param(param: &str, what: &'static str) -> Result<(String, u64), CommandParseError> {
        if param.is_empty() {
            return Err(CommandParseError::MissingFilename(what));
        }

        if let Some((filename, offset)) = param.rsplit_once(char::is_whitespace) {
            if let Ok(offset) = offset.parse::<u64>() {
                let filename = filename.trim();
                if !filename.is_empty() {
                    return Ok((filename.to_string(), offset));
                }
            }
        }
        Ok((param.to_string(), 0))
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Echo(text) => write!(f, "{} {}", Self::ECHO, text),
            Command::Time => write!(f, "{}", Self::TIME),
            Command::Upload { filename, offset } => write!(f, "{} {} {}", Self::UPLOAD, filename, offset),
            Command::Download { filename, offset } => write!(f, "{} {} {}", Self::DOWNLOAD, filename, offset),
        }
    }
}
