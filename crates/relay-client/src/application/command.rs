//! Parsing of what the user types into the terminal client.
//!
//! | Input               | Command                               |
//! |---------------------|---------------------------------------|
//! | `hello`             | send "hello" to everyone              |
//! | `/to bob,carol hi`  | send "hi" to bob and carol            |
//! | `/users`            | print who is online                   |
//! | `/history [name]`   | print received packages (from `name`) |
//! | `/forget <name>`    | drop stored packages from `name`      |
//! | `/quit`             | leave the relay                       |

use relay_core::Recipients;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("nothing to send")]
    Empty,
    #[error("unknown command '/{0}'")]
    Unknown(String),
    #[error("usage: /to <name[,name...]> <text>")]
    MissingRecipients,
    #[error("usage: /{0} <name>")]
    MissingName(&'static str),
}

/// One line of user input, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Send { recipients: Recipients, text: String },
    Users,
    History { sender: Option<String> },
    Forget { sender: String },
    Quit,
}

impl ClientCommand {
    /// Parses one input line.
    ///
    /// # Errors
    ///
    /// [`CommandError`] describing what is wrong with the line.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(CommandError::Empty);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Self::Send {
                recipients: Recipients::All,
                text: line.to_string(),
            });
        };

        let (command, argument) = match rest.split_once(char::is_whitespace) {
            Some((command, argument)) => (command, argument.trim()),
            None => (rest, ""),
        };
        match command {
            "to" => {
                let (names, text) = argument
                    .split_once(char::is_whitespace)
                    .ok_or(CommandError::MissingRecipients)?;
                let text = text.trim();
                if text.is_empty() {
                    return Err(CommandError::MissingRecipients);
                }
                Ok(Self::Send {
                    recipients: Recipients::parse(names),
                    text: text.to_string(),
                })
            }
            "users" => Ok(Self::Users),
            "history" => Ok(Self::History {
                sender: (!argument.is_empty()).then(|| argument.to_string()),
            }),
            "forget" if argument.is_empty() => Err(CommandError::MissingName("forget")),
            "forget" => Ok(Self::Forget {
                sender: argument.to_string(),
            }),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_line_goes_to_everyone() {
        // Act
        let command = ClientCommand::parse("  good morning  ").unwrap();

        // Assert
        assert_eq!(
            command,
            ClientCommand::Send {
                recipients: Recipients::All,
                text: "good morning".to_string(),
            }
        );
    }

    #[test]
    fn test_to_parses_name_list_and_keeps_text_spacing() {
        let command = ClientCommand::parse("/to bob,carol see  you").unwrap();
        assert_eq!(
            command,
            ClientCommand::Send {
                recipients: Recipients::Names(vec!["bob".into(), "carol".into()]),
                text: "see  you".to_string(),
            }
        );
    }

    #[test]
    fn test_to_without_text_is_an_error() {
        assert_eq!(ClientCommand::parse("/to bob"), Err(CommandError::MissingRecipients));
        assert_eq!(ClientCommand::parse("/to"), Err(CommandError::MissingRecipients));
    }

    #[test]
    fn test_history_with_and_without_sender() {
        assert_eq!(
            ClientCommand::parse("/history"),
            Ok(ClientCommand::History { sender: None })
        );
        assert_eq!(
            ClientCommand::parse("/history alice"),
            Ok(ClientCommand::History {
                sender: Some("alice".into())
            })
        );
    }

    #[test]
    fn test_forget_requires_a_name() {
        assert_eq!(
            ClientCommand::parse("/forget"),
            Err(CommandError::MissingName("forget"))
        );
    }

    #[test]
    fn test_unknown_and_empty_input() {
        assert_eq!(
            ClientCommand::parse("/dance"),
            Err(CommandError::Unknown("dance".into()))
        );
        assert_eq!(ClientCommand::parse("   "), Err(CommandError::Empty));
        assert_eq!(ClientCommand::parse("/quit"), Ok(ClientCommand::Quit));
    }
}
