//! Shell-command renderings of SSH jobs.
//!
//! Instead of executing anything, these emit a bash array literal that
//! reproduces the connection parameters as a usable `ssh`, `scp`, or
//! `rsync` command line. Each argv word is shell-quoted individually; in
//! the scp/rsync modes a literal `{}` token marks where the
//! `user@host` endpoint is substituted.

use std::borrow::Cow;

use shell_escape::unix::escape;
use thiserror::Error;

/// Alternate output mode: render a command line instead of executing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PrintMode {
    /// Render an `ssh` invocation.
    Ssh,
    /// Render an `scp` invocation.
    Scp,
    /// Render an `rsync` invocation.
    Rsync,
}

/// Errors raised while rendering command lines.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PrintError {
    /// The scp/rsync argv does not contain the `{}` placeholder.
    #[error("placeholder {{}} not found")]
    MissingPlaceholder,
    /// An endpoint string did not split into host and port.
    #[error("cannot get host:port from {endpoint}")]
    Endpoint {
        /// Offending endpoint string.
        endpoint: String,
    },
}

pub(crate) fn split_endpoint(endpoint: &str) -> Result<(&str, &str), PrintError> {
    endpoint
        .rsplit_once(':')
        .ok_or_else(|| PrintError::Endpoint {
            endpoint: endpoint.to_owned(),
        })
}

/// Joins argv words into one shell command, quoting each word on its own.
#[must_use]
pub fn shell_join(words: &[String]) -> String {
    words
        .iter()
        .map(|word| escape(Cow::from(word.as_str())).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Replaces every `{}` in the argv with `replacement` and joins the words
/// with shell quoting.
///
/// # Errors
///
/// Returns [`PrintError::MissingPlaceholder`] when no word contains `{}`.
pub fn expand_placeholder(command: &[String], replacement: &str) -> Result<String, PrintError> {
    let mut found = false;
    let replaced: Vec<String> = command
        .iter()
        .map(|word| {
            if word.contains("{}") {
                found = true;
            }
            word.replace("{}", replacement)
        })
        .collect();
    if !found {
        return Err(PrintError::MissingPlaceholder);
    }
    Ok(shell_join(&replaced))
}

fn endpoint_of(user: &str, host: &str) -> String {
    if user.is_empty() {
        host.to_owned()
    } else {
        format!("{user}@{host}")
    }
}

fn agent_available() -> bool {
    std::env::var("SSH_AUTH_SOCK").is_ok_and(|sock| !sock.is_empty())
}

/// Renders an `ssh` invocation as a bash array literal. Argv words before
/// a `--` separator become ssh options; words after it follow the
/// `user@host` argument.
///
/// # Errors
///
/// This rendering cannot fail; the `Result` keeps the three print
/// functions interchangeable.
#[expect(clippy::too_many_arguments, reason = "mirrors the endpoint tuple of the job")]
pub fn print_ssh_conf(
    out: &mut String,
    bastion: &str,
    bastion_port: &str,
    bastion_user: &str,
    host: &str,
    port: &str,
    user: &str,
    command: &[String],
) -> Result<(), PrintError> {
    let bastion_endpoint = endpoint_of(bastion_user, bastion);
    let host_endpoint = endpoint_of(user, host);

    let (pre, post) = match command.iter().position(|word| word == "--") {
        Some(index) => (&command[..index], &command[index + 1..]),
        None => (command, &command[command.len()..]),
    };

    out.push_str("(ssh ");
    if agent_available() {
        out.push_str("-A ");
    }
    out.push_str("-o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null ");
    if !bastion.is_empty() {
        out.push_str(&format!(
            "-o \"ProxyCommand=ssh -p {bastion_port} -q {bastion_endpoint} nc %h %p\" "
        ));
    }
    out.push_str(&format!("-p {port} "));
    if !pre.is_empty() {
        out.push_str(&shell_join(pre));
        out.push(' ');
    }
    out.push_str(&format!("\"{host_endpoint}\""));
    if !post.is_empty() {
        out.push(' ');
        out.push_str(&shell_join(post));
    }
    out.push(')');
    Ok(())
}

/// Renders an `scp` invocation as a bash array literal; the argv must
/// contain a `{}` placeholder for the `user@host` endpoint.
///
/// # Errors
///
/// Returns [`PrintError::MissingPlaceholder`] when the argv lacks `{}`.
#[expect(clippy::too_many_arguments, reason = "mirrors the endpoint tuple of the job")]
pub fn print_scp_conf(
    out: &mut String,
    bastion: &str,
    bastion_port: &str,
    bastion_user: &str,
    host: &str,
    port: &str,
    user: &str,
    command: &[String],
) -> Result<(), PrintError> {
    let bastion_endpoint = endpoint_of(bastion_user, bastion);
    let host_endpoint = endpoint_of(user, host);

    out.push_str("(scp ");
    out.push_str("-o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null ");
    if !bastion.is_empty() {
        out.push_str(&format!(
            "-o \"ProxyCommand=ssh -p {bastion_port} -q {bastion_endpoint} nc %h %p\" "
        ));
    }
    out.push_str(&format!("-P {port} "));
    out.push_str(&expand_placeholder(command, &host_endpoint)?);
    out.push(')');
    Ok(())
}

/// Renders an `rsync` invocation as a bash array literal; the argv must
/// contain a `{}` placeholder for the `user@host` endpoint.
///
/// # Errors
///
/// Returns [`PrintError::MissingPlaceholder`] when the argv lacks `{}`.
#[expect(clippy::too_many_arguments, reason = "mirrors the endpoint tuple of the job")]
pub fn print_rsync_conf(
    out: &mut String,
    bastion: &str,
    bastion_port: &str,
    bastion_user: &str,
    host: &str,
    port: &str,
    user: &str,
    command: &[String],
) -> Result<(), PrintError> {
    let bastion_endpoint = endpoint_of(bastion_user, bastion);
    let host_endpoint = endpoint_of(user, host);

    out.push_str("(rsync ");
    out.push_str("-e 'ssh -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null ");
    if !bastion.is_empty() {
        out.push_str(&format!(
            "-o \"ProxyCommand=ssh -p {bastion_port} -q {bastion_endpoint} nc %h %p\" "
        ));
    }
    out.push_str(&format!("-p {port}' "));
    out.push_str(&expand_placeholder(command, &host_endpoint)?);
    out.push(')');
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|word| (*word).to_owned()).collect()
    }

    fn with_agent_socket() {
        // Both ssh fixtures expect the agent flag; the value itself is
        // irrelevant.
        unsafe { std::env::set_var("SSH_AUTH_SOCK", "TEST") };
    }

    #[test]
    fn scp_without_bastion() {
        let mut out = String::new();
        print_scp_conf(
            &mut out,
            "",
            "",
            "",
            "HOST",
            "PORT",
            "USER",
            &argv(&["-SCP_OPT", "SCP ARG", "{}:THE DIR"]),
        )
        .unwrap_or_else(|err| panic!("render: {err}"));
        assert_eq!(
            out,
            r"(scp -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -P PORT -SCP_OPT 'SCP ARG' 'USER@HOST:THE DIR')"
        );
    }

    #[test]
    fn scp_with_bastion() {
        let mut out = String::new();
        print_scp_conf(
            &mut out,
            "BHOST",
            "BPORT",
            "BUSER",
            "HOST",
            "PORT",
            "USER",
            &argv(&["-SCP_OPT", "SCP ARG", "{}:THE DIR"]),
        )
        .unwrap_or_else(|err| panic!("render: {err}"));
        assert_eq!(
            out,
            r#"(scp -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -o "ProxyCommand=ssh -p BPORT -q BUSER@BHOST nc %h %p" -P PORT -SCP_OPT 'SCP ARG' 'USER@HOST:THE DIR')"#
        );
    }

    #[test]
    fn rsync_without_bastion() {
        let mut out = String::new();
        print_rsync_conf(
            &mut out,
            "",
            "",
            "",
            "HOST",
            "PORT",
            "USER",
            &argv(&["-RSYNC_OPT", "RSYNC ARG", "{}:THE DIR"]),
        )
        .unwrap_or_else(|err| panic!("render: {err}"));
        assert_eq!(
            out,
            r"(rsync -e 'ssh -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -p PORT' -RSYNC_OPT 'RSYNC ARG' 'USER@HOST:THE DIR')"
        );
    }

    #[test]
    fn rsync_with_bastion() {
        let mut out = String::new();
        print_rsync_conf(
            &mut out,
            "BHOST",
            "BPORT",
            "BUSER",
            "HOST",
            "PORT",
            "USER",
            &argv(&["-RSYNC_OPT", "RSYNC ARG", "{}:THE DIR"]),
        )
        .unwrap_or_else(|err| panic!("render: {err}"));
        assert_eq!(
            out,
            r#"(rsync -e 'ssh -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -o "ProxyCommand=ssh -p BPORT -q BUSER@BHOST nc %h %p" -p PORT' -RSYNC_OPT 'RSYNC ARG' 'USER@HOST:THE DIR')"#
        );
    }

    #[test]
    fn ssh_without_bastion() {
        with_agent_socket();
        let mut out = String::new();
        print_ssh_conf(
            &mut out,
            "",
            "",
            "",
            "HOST",
            "PORT",
            "USER",
            &argv(&["-M", "-v"]),
        )
        .unwrap_or_else(|err| panic!("render: {err}"));
        assert_eq!(
            out,
            r#"(ssh -A -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -p PORT -M -v "USER@HOST")"#
        );
    }

    #[test]
    fn ssh_with_bastion() {
        with_agent_socket();
        let mut out = String::new();
        print_ssh_conf(
            &mut out,
            "BHOST",
            "BPORT",
            "BUSER",
            "HOST",
            "PORT",
            "USER",
            &argv(&["-M", "-v"]),
        )
        .unwrap_or_else(|err| panic!("render: {err}"));
        assert_eq!(
            out,
            r#"(ssh -A -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -o "ProxyCommand=ssh -p BPORT -q BUSER@BHOST nc %h %p" -p PORT -M -v "USER@HOST")"#
        );
    }

    #[test]
    fn ssh_places_words_after_the_separator_behind_the_endpoint() {
        with_agent_socket();
        let mut out = String::new();
        print_ssh_conf(
            &mut out,
            "",
            "",
            "",
            "HOST",
            "22",
            "USER",
            &argv(&["-v", "--", "uptime", "-p"]),
        )
        .unwrap_or_else(|err| panic!("render: {err}"));
        assert_eq!(
            out,
            r#"(ssh -A -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null -p 22 -v "USER@HOST" uptime -p)"#
        );
    }

    #[test]
    fn placeholder_expansion_accepts_any_word() {
        for words in [
            vec!["hello there", "{}:"],
            vec!["{}:", "hello there"],
            vec!["hello", "there", "{}:/src/the dir", "dest/the dir"],
            vec!["hello", "there", "src/the dir", "{}:dest/the dir"],
        ] {
            let command = argv(&words);
            let result = expand_placeholder(&command, "REMOTE");
            assert!(result.is_ok(), "expected success for {words:?}");
        }
    }

    #[test]
    fn placeholder_expansion_requires_the_token() {
        for words in [
            vec![],
            vec!["hello there"],
            vec!["hello", "there", "/src/the dir", "dest/the dir"],
        ] {
            let command = argv(&words);
            let result = expand_placeholder(&command, "REMOTE");
            assert_eq!(result, Err(PrintError::MissingPlaceholder));
        }
    }

    #[test]
    fn endpoints_split_on_the_last_colon() {
        assert_eq!(split_endpoint("10.0.0.4:22"), Ok(("10.0.0.4", "22")));
        assert!(split_endpoint("no-port").is_err());
    }
}
