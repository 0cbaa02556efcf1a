//! Image runtime configuration checks.
//!
//! Custom images may change filesystem contents only. The entrypoint must be
//! unset and the default command must be a plain shell.

use crate::core::constants::ALLOWED_IMAGE_CMDS;

use super::runtime::ImageConfig;

/// Returns the human-readable validation message if the image is rejected.
pub fn validate_image_config(config: &ImageConfig) -> Result<(), String> {
    let mut error_msg = String::new();

    if config.entrypoint.is_some() {
        error_msg.push_str("Custom images may not use the ENTRYPOINT directive.\n");
    }

    let cmd_allowed = config.cmd.as_ref().is_some_and(|cmd| {
        ALLOWED_IMAGE_CMDS
            .iter()
            .any(|allowed| cmd.iter().map(String::as_str).eq(allowed.iter().copied()))
    });
    if !cmd_allowed {
        error_msg.push_str(&format!(
            "Custom images may not use the CMD directive. Expected [\"/bin/bash\"] but was \"{}\".\n",
            list_repr(config.cmd.as_deref())
        ));
    }

    if error_msg.is_empty() {
        Ok(())
    } else {
        Err(error_msg)
    }
}

/// Render a command the way the web API has always shown it: `['a', 'b']`, or `None`.
fn list_repr(cmd: Option<&[String]>) -> String {
    let Some(cmd) = cmd else {
        return "None".to_string();
    };
    let items: Vec<String> = cmd.iter().map(|s| str_repr(s)).collect();
    format!("[{}]", items.join(", "))
}

fn str_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}
