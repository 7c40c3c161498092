//! Command text parser
//!
//! Arguments are whitespace separated. `config set` keeps everything after
//! the key as the value so URLs and passwords with spaces survive.

use crate::error::{NavError, NavResult};

/// Optional prefix chat users type before every command.
pub const COMMAND_PREFIX: &str = "/alist";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ConfigShow,
    ConfigSetup,
    ConfigSet { key: String, value: String },
    ConfigTest,
    ClearCache,
    /// `ls`, `ls <path>` or `ls <n>`
    List(Option<String>),
    Search { keyword: String, path: Option<String> },
    Info(String),
    /// `download <path>` or `download <n>`
    Download(String),
    Quit,
    Upload,
    UploadCancel,
    Help,
}

impl Command {
    /// Verb for logs. Never includes arguments, which may carry secrets.
    pub fn name(&self) -> &'static str {
        match self {
            Command::ConfigShow => "config show",
            Command::ConfigSetup => "config setup",
            Command::ConfigSet { .. } => "config set",
            Command::ConfigTest => "config test",
            Command::ClearCache => "config clear_cache",
            Command::List(_) => "ls",
            Command::Search { .. } => "search",
            Command::Info(_) => "info",
            Command::Download(_) => "download",
            Command::Quit => "quit",
            Command::Upload => "upload",
            Command::UploadCancel => "upload cancel",
            Command::Help => "help",
        }
    }
}

/// A numeric argument addresses the current indexed listing.
pub fn as_index(arg: &str) -> Option<usize> {
    if arg.is_empty() || !arg.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    arg.parse().ok()
}

pub fn parse(text: &str) -> NavResult<Command> {
    let mut text = text.trim();
    if let Some(rest) = text.strip_prefix(COMMAND_PREFIX) {
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            text = rest.trim_start();
        }
    }

    let (verb, rest) = split_word(text);
    match verb {
        "" | "help" => Ok(Command::Help),
        "config" => parse_config(rest),
        "ls" => Ok(Command::List(optional(rest))),
        "search" => {
            let (keyword, path) = split_word(rest);
            if keyword.is_empty() {
                return Err(NavError::BadArgument(
                    "missing keyword\nusage: search <keyword> [path]".to_string(),
                ));
            }
            Ok(Command::Search {
                keyword: keyword.to_string(),
                path: optional(path),
            })
        }
        "info" => required(rest, "usage: info <path>").map(Command::Info),
        "download" => required(rest, "usage: download <path|n>").map(Command::Download),
        "quit" => Ok(Command::Quit),
        "upload" => match rest {
            "" => Ok(Command::Upload),
            "cancel" => Ok(Command::UploadCancel),
            other => Err(NavError::BadArgument(format!(
                "unknown upload action: {}\nusage: upload | upload cancel",
                other
            ))),
        },
        other => Err(NavError::UnknownCommand(other.to_string())),
    }
}

fn parse_config(rest: &str) -> NavResult<Command> {
    let (action, rest) = split_word(rest);
    match action {
        "" | "show" => Ok(Command::ConfigShow),
        "setup" => Ok(Command::ConfigSetup),
        "test" => Ok(Command::ConfigTest),
        "clear_cache" => Ok(Command::ClearCache),
        "set" => {
            let (key, value) = split_word(rest);
            if key.is_empty() {
                return Err(NavError::BadArgument("missing key\nusage: config set <key> <value>".to_string()));
            }
            if value.is_empty() {
                return Err(NavError::BadArgument(format!("missing value for {}", key)));
            }
            Ok(Command::ConfigSet {
                key: key.to_string(),
                value: value.to_string(),
            })
        }
        other => Err(NavError::BadArgument(format!(
            "unknown config action: {}\nsupported: show, setup, set, test, clear_cache",
            other
        ))),
    }
}

fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim();
    match text.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (text, ""),
    }
}

fn optional(arg: &str) -> Option<String> {
    let arg = arg.trim();
    (!arg.is_empty()).then(|| arg.to_string())
}

fn required(arg: &str, usage: &str) -> NavResult<String> {
    optional(arg).ok_or_else(|| NavError::BadArgument(format!("missing argument\n{}", usage)))
}
