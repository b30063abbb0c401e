//! Agent configuration.
//!
//! Priority: CLI flag > environment > default.

use aider_acp_parser::EditFormat;

/// How to launch and drive the aider CLI.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub aider_command: String,
    pub aider_args: Vec<String>,
    pub edit_format: Option<EditFormat>,
}

impl AgentConfig {
    /// Build configuration from CLI inputs and the environment.
    pub fn create(
        command: Option<String>,
        edit_format: Option<String>,
        extra_args: Vec<String>,
    ) -> anyhow::Result<Self> {
        let aider_command = command
            .or_else(|| std::env::var("AIDER_ACP_COMMAND").ok())
            .unwrap_or_else(|| "aider".to_string());

        let edit_format = match edit_format {
            Some(name) => Some(
                EditFormat::parse(&name)
                    .ok_or_else(|| anyhow::anyhow!("unknown edit format: {name}"))?,
            ),
            None => None,
        };

        // --no-pretty keeps colors, pagers, and fancy prompts out of the
        // stream we have to interpret.
        let mut aider_args = vec!["--no-pretty".to_string()];
        if let Some(format) = edit_format {
            aider_args.push("--edit-format".to_string());
            aider_args.push(format.as_str().to_string());
        }
        aider_args.extend(extra_args);

        Ok(Self {
            aider_command,
            aider_args,
            edit_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AgentConfig::create(None, None, Vec::new()).unwrap();
        assert!(!config.aider_command.is_empty());
        assert_eq!(config.aider_args[0], "--no-pretty");
        assert_eq!(config.edit_format, None);
    }

    #[test]
    fn edit_format_flag_forwarded() {
        let config =
            AgentConfig::create(None, Some("editor-diff".into()), Vec::new()).unwrap();
        assert_eq!(config.edit_format, Some(EditFormat::EditorDiff));
        assert!(
            config
                .aider_args
                .windows(2)
                .any(|w| w == ["--edit-format", "editor-diff"])
        );
    }

    #[test]
    fn unknown_edit_format_rejected() {
        assert!(AgentConfig::create(None, Some("patch".into()), Vec::new()).is_err());
    }

    #[test]
    fn extra_args_appended() {
        let config = AgentConfig::create(
            Some("aider-dev".into()),
            None,
            vec!["--model".into(), "gpt-4o".into()],
        )
        .unwrap();
        assert_eq!(config.aider_command, "aider-dev");
        assert!(config.aider_args.ends_with(&["--model".into(), "gpt-4o".into()]));
    }
}
