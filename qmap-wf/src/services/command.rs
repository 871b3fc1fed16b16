//! External command execution
//!
//! Commands are described by a program plus argument templates with
//! `{placeholder}` substitution. Children are spawned with `kill_on_drop`,
//! so dropping the future (timeout, cancellation) kills the process.

use crate::error::ToolError;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Program and argument templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Substitute placeholders in every argument
    pub fn render(&self, vars: &BTreeMap<String, String>) -> Result<Vec<String>, ToolError> {
        self.args.iter().map(|arg| render_template(arg, vars)).collect()
    }
}

/// Replace every `{name}` in `template` with `vars[name]`.
///
/// `{{` and `}}` produce literal braces. Unknown names are an error so a
/// typo in the config cannot reach the command line.
pub fn render_template(template: &str, vars: &BTreeMap<String, String>) -> Result<String, ToolError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if !closed {
                    return Err(ToolError::Template(format!(
                        "unterminated placeholder in '{}'",
                        template
                    )));
                }
                let value = vars.get(&name).ok_or_else(|| {
                    ToolError::Template(format!("unknown placeholder {{{}}} in '{}'", name, template))
                })?;
                out.push_str(value);
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Run `program args`, sending stdout and stderr to `log_path`
pub async fn run_logged(program: &str, args: &[String], log_path: &Path) -> Result<(), ToolError> {
    if let Some(parent) = log_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let log = std::fs::File::create(log_path)?;
    let log_err = log.try_clone()?;

    tracing::debug!(program, args = ?args, log = %log_path.display(), "Running command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ToolError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let status = child.wait().await?;
    if !status.success() {
        return Err(ToolError::ExitStatus {
            program: program.to_string(),
            status: status.to_string(),
            log: log_path.to_path_buf(),
        });
    }
    Ok(())
}

/// Run `program args` and return its standard output
pub async fn run_captured(program: &str, args: &[String]) -> Result<Vec<u8>, ToolError> {
    tracing::debug!(program, args = ?args, "Running command");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ToolError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ToolError::Output(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            stderr.trim()
        )));
    }
    Ok(output.stdout)
}

/// Unpack a `.tar.gz` archive into `dest_dir`
pub async fn unpack_tar_gz(archive_path: &Path, dest_dir: &Path) -> Result<(), ToolError> {
    tokio::fs::create_dir_all(dest_dir).await?;
    let args = vec![
        "-xzf".to_string(),
        archive_path.display().to_string(),
        "-C".to_string(),
        dest_dir.display().to_string(),
    ];
    run_captured("tar", &args).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let v = vars(&[("scan_dir", "/w/in"), ("output_dir", "/w/out")]);
        assert_eq!(render_template("{scan_dir}:/input", &v).unwrap(), "/w/in:/input");
        assert_eq!(render_template("{scan_dir}-{output_dir}", &v).unwrap(), "/w/in-/w/out");
        assert_eq!(render_template("--batch-mode", &v).unwrap(), "--batch-mode");
    }

    #[test]
    fn test_render_escaped_braces() {
        assert_eq!(render_template("{{literal}}", &BTreeMap::new()).unwrap(), "{literal}");
    }

    #[test]
    fn test_render_unknown_placeholder_is_error() {
        let err = render_template("{contaner}", &vars(&[("container", "x")])).unwrap_err();
        assert!(err.to_string().contains("contaner"));
    }

    #[test]
    fn test_render_unterminated_placeholder_is_error() {
        assert!(render_template("{scan_dir", &vars(&[("scan_dir", "x")])).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_logged_captures_output_and_status() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("logs").join("cmd.log");

        run_logged("sh", &["-c".to_string(), "echo hello; echo oops >&2".to_string()], &log)
            .await
            .unwrap();
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.contains("hello"));
        assert!(content.contains("oops"));

        let err = run_logged("sh", &["-c".to_string(), "exit 3".to_string()], &log)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExitStatus { .. }));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = run_logged("qmap-no-such-program", &[], &dir.path().join("x.log"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }
}
