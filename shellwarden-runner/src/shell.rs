use std::path::Path;

/// Shell invocation used to run a command string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellInvocation {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellInvocation {
    pub fn for_script(program: String, script: String) -> Self {
        #[cfg(windows)]
        let args = vec!["/C".to_string(), script];
        #[cfg(not(windows))]
        let args = vec!["-c".to_string(), script];
        Self { program, args }
    }
}

/// Resolve the shell program, preferring the configured one when it exists.
#[cfg(not(windows))]
pub fn resolve_shell(preferred: Option<&str>) -> String {
    if let Some(shell) = preferred {
        let trimmed = shell.trim();
        if !trimmed.is_empty() && (Path::new(trimmed).exists() || !trimmed.contains('/')) {
            return trimmed.to_string();
        }
        tracing::warn!(shell = trimmed, "configured shell not found; falling back");
    }

    // Brace groups and `$?` need a POSIX shell.
    const SHELL_CANDIDATES: &[&str] = &["/bin/bash", "/usr/bin/bash", "/bin/sh", "/usr/bin/sh"];

    for shell_path in SHELL_CANDIDATES {
        if Path::new(shell_path).exists() {
            return (*shell_path).to_string();
        }
    }

    "/bin/sh".to_string()
}

#[cfg(windows)]
pub fn resolve_shell(preferred: Option<&str>) -> String {
    preferred
        .map(str::trim)
        .filter(|shell| !shell.is_empty() && Path::new(shell).exists())
        .map_or_else(|| "cmd.exe".to_string(), ToString::to_string)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn falls_back_when_preferred_path_is_missing() {
        let shell = resolve_shell(Some("/definitely/not/a/shell"));
        assert!(Path::new(&shell).exists());
    }

    #[test]
    fn bare_program_names_are_trusted() {
        assert_eq!(resolve_shell(Some("zsh")), "zsh");
    }

    #[test]
    fn script_is_passed_with_dash_c() {
        let invocation = ShellInvocation::for_script("/bin/sh".into(), "echo hi".into());
        assert_eq!(invocation.args, vec!["-c", "echo hi"]);
    }
}
