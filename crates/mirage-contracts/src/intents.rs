use crate::artifacts::{normalize_ratio, GenerationMode};

/// One user action against the orchestrator, parsed from a studio REPL line.
/// Plain text (no leading slash) edits the prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum UserIntent {
    Noop,
    SetMode(GenerationMode),
    SetPrompt(String),
    SetRatio(String),
    SetPublic(bool),
    Attach(String),
    Generate,
    Select(String),
    Delete(String),
    Recreate(String),
    RefreshExamples,
    ShowHistory,
    ShowView,
    Help,
    Quit,
    Unknown { command: String },
    Invalid { message: String },
}

pub const INTENT_HELP: &str = "\
/mode text|image      switch generation mode
/ratio 1:1|4:3|3:4|16:9|9:16
/public on|off        toggle result visibility
/attach <path>        attach an image (image mode)
/generate             submit the current form
/select <id>          select a history artifact
/delete <id>          delete a history artifact
/recreate <id>        reuse an example image
/examples             re-sample the example strip
/history              list the active mode's artifacts
/view                 print the current view state
/help                 this text
/quit                 leave the studio
<anything else>       becomes the prompt";

pub fn parse_intent(text: &str) -> UserIntent {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return UserIntent::Noop;
    }

    let Some(slash_tail) = trimmed.strip_prefix('/') else {
        return UserIntent::SetPrompt(trimmed.to_string());
    };

    let command_len = slash_tail
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
        .count();
    if command_len == 0 {
        return UserIntent::SetPrompt(trimmed.to_string());
    }
    let command = slash_tail[..command_len].to_ascii_lowercase();
    let arg = slash_tail[command_len..].trim();

    match command.as_str() {
        "mode" => match GenerationMode::parse(arg) {
            Some(mode) => UserIntent::SetMode(mode),
            None => UserIntent::Invalid {
                message: format!("unknown mode '{arg}' (expected text or image)"),
            },
        },
        "ratio" => match normalize_ratio(arg) {
            Some(ratio) => UserIntent::SetRatio(ratio.to_string()),
            None => UserIntent::Invalid {
                message: format!("unsupported ratio '{arg}'"),
            },
        },
        "public" => match arg.to_ascii_lowercase().as_str() {
            "on" | "true" | "yes" => UserIntent::SetPublic(true),
            "off" | "false" | "no" => UserIntent::SetPublic(false),
            _ => UserIntent::Invalid {
                message: format!("expected on or off, got '{arg}'"),
            },
        },
        "attach" => match single_path_arg(arg) {
            Some(path) => UserIntent::Attach(path),
            None => UserIntent::Invalid {
                message: "attach needs a file path".to_string(),
            },
        },
        "generate" | "go" => UserIntent::Generate,
        "select" | "use" => id_intent(arg, &command, UserIntent::Select),
        "delete" | "rm" => id_intent(arg, &command, UserIntent::Delete),
        "recreate" => id_intent(arg, &command, UserIntent::Recreate),
        "examples" | "change" => UserIntent::RefreshExamples,
        "history" => UserIntent::ShowHistory,
        "view" | "state" => UserIntent::ShowView,
        "help" => UserIntent::Help,
        "quit" | "exit" => UserIntent::Quit,
        _ => UserIntent::Unknown { command },
    }
}

fn id_intent(arg: &str, command: &str, build: impl FnOnce(String) -> UserIntent) -> UserIntent {
    if arg.is_empty() {
        return UserIntent::Invalid {
            message: format!("{command} needs an artifact id"),
        };
    }
    build(arg.to_string())
}

fn single_path_arg(arg: &str) -> Option<String> {
    let parts = match shell_words::split(arg) {
        Ok(parts) => parts,
        Err(_) => arg.split_whitespace().map(str::to_string).collect(),
    };
    let parts: Vec<String> = parts.into_iter().filter(|value| !value.is_empty()).collect();
    match parts.len() {
        0 => None,
        1 => Some(parts[0].clone()),
        _ => Some(parts.join(" ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_becomes_prompt() {
        assert_eq!(
            parse_intent("  a cat in a hat  "),
            UserIntent::SetPrompt("a cat in a hat".to_string())
        );
    }

    #[test]
    fn empty_line_is_noop() {
        assert_eq!(parse_intent("   "), UserIntent::Noop);
    }

    #[test]
    fn mode_command_parses_aliases() {
        assert_eq!(
            parse_intent("/mode img2img"),
            UserIntent::SetMode(GenerationMode::Image)
        );
        assert!(matches!(
            parse_intent("/mode audio"),
            UserIntent::Invalid { .. }
        ));
    }

    #[test]
    fn ratio_command_validates() {
        assert_eq!(parse_intent("/ratio 16x9"), UserIntent::SetRatio("16:9".to_string()));
        assert!(matches!(parse_intent("/ratio 5:7"), UserIntent::Invalid { .. }));
    }

    #[test]
    fn attach_handles_quoted_paths() {
        assert_eq!(
            parse_intent("/attach \"my cat.png\""),
            UserIntent::Attach("my cat.png".to_string())
        );
        assert!(matches!(parse_intent("/attach"), UserIntent::Invalid { .. }));
    }

    #[test]
    fn id_commands_require_argument() {
        assert_eq!(parse_intent("/select art_1"), UserIntent::Select("art_1".to_string()));
        assert!(matches!(parse_intent("/delete"), UserIntent::Invalid { .. }));
    }

    #[test]
    fn unknown_command_is_reported_not_swallowed() {
        assert_eq!(
            parse_intent("/teleport"),
            UserIntent::Unknown {
                command: "teleport".to_string()
            }
        );
    }

    #[test]
    fn bare_slash_is_prompt_text() {
        assert_eq!(
            parse_intent("/ slash art"),
            UserIntent::SetPrompt("/ slash art".to_string())
        );
    }
}
