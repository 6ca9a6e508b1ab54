use teloxide::utils::command::{BotCommands, ParseError};

/// Shown for /start and /help.
pub const HELP_TEXT: &str = "Available commands:
/help - Show this help message
/settoken <token> - Set your OpenRouter API token
/model - Show current AI model
/models - List available AI models
/setmodel <name> - Set current AI model by name
/addmodel <your_name> <openrouter_id> - Add a new model to your list
/removemodel <name> - Remove a model from your list
/getcredits - Check your OpenRouter credits balance
Just send a message to chat with the current AI model!";

/// Bot commands that can be invoked with /.
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Available commands:")]
pub enum Command {
    #[command(description = "Start the bot and get help")]
    Start,

    #[command(description = "Show help message")]
    Help,

    #[command(description = "Set your OpenRouter API token: /settoken <token>")]
    SetToken(String),

    #[command(description = "Show current AI model")]
    Model,

    #[command(description = "List available AI models")]
    Models,

    #[command(description = "Set current AI model by name: /setmodel <name>")]
    SetModel(String),

    #[command(description = "Add a model: /addmodel <your_name> <openrouter_id>")]
    AddModel(String),

    #[command(description = "Remove a model from your list: /removemodel <name>")]
    RemoveModel(String),

    #[command(description = "Toggle debug logging")]
    Debug,

    #[command(description = "Check your OpenRouter credits balance")]
    GetCredits,
}

/// Result of reading a message as a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    Command(Command),
    /// Starts with `/` but names no known command, or is malformed.
    Unknown,
    /// Ordinary chat text.
    Text,
}

pub fn parse(text: &str, bot_name: &str) -> Parsed {
    if !text.starts_with('/') {
        return Parsed::Text;
    }
    match Command::parse(text, bot_name) {
        Ok(command) => Parsed::Command(command),
        Err(ParseError::WrongBotName(name)) => {
            tracing::debug!(component = "commands", bot_name = %name, "Command addressed to another bot");
            Parsed::Unknown
        }
        Err(_) => Parsed::Unknown,
    }
}

/// Split `/addmodel` arguments into a trimmed (name, openrouter_id) pair.
pub fn split_model_args(args: &str) -> Option<(&str, &str)> {
    let (name, id) = args.trim().split_once(' ')?;
    Some((name.trim(), id.trim()))
}
