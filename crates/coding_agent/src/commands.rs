pub const HELP_TEXT: &str = "Commands: /help, /model [provider/model], /clear, /sessions, /status, /quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Help,
    /// Switch to `provider/model`; without an argument, show the current one.
    Model(Option<String>),
    Clear,
    Sessions,
    Status,
    Quit,
    Unknown(String),
}

pub fn parse_slash_command(input: &str) -> Option<SlashCommand> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    let mut parts = trimmed.split_whitespace();
    let command = parts.next().unwrap_or(trimmed).to_string();
    let argument = parts.next().map(ToString::to_string);

    let parsed = match command.as_str() {
        "/help" => SlashCommand::Help,
        "/model" => SlashCommand::Model(argument),
        "/clear" => SlashCommand::Clear,
        "/sessions" => SlashCommand::Sessions,
        "/status" => SlashCommand::Status,
        "/quit" | "/exit" => SlashCommand::Quit,
        _ => SlashCommand::Unknown(command),
    };

    Some(parsed)
}
