use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    task::JoinHandle,
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_relay_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("message_relay");
    let server = RelayServer::start(&binary).await?;

    let mut alice = Chat::join(&binary, "alice", &server.addr).await?;
    alice.expect("*** known users: alice").await?;
    alice.expect("*** contacts: (none)").await?;

    let mut bob = Chat::join(&binary, "bob", &server.addr).await?;
    bob.expect("*** known users: alice, bob").await?;
    bob.expect("*** contacts: (none)").await?;

    // Messages reach only the addressed user.
    alice.type_line("/msg bob Hello from Alice").await?;
    bob.expect("<alice> Hello from Alice").await?;
    bob.type_line("/msg alice Hi Alice!").await?;
    alice.expect("<bob> Hi Alice!").await?;

    // Contact list edits are acknowledged and visible on the next query.
    alice.type_line("/add bob").await?;
    alice.expect("*** ok").await?;
    alice.type_line("/contacts").await?;
    alice.expect("*** contacts: bob").await?;

    alice.type_line("/quit").await?;
    alice.expect("*** leaving chat").await?;
    bob.type_line("/quit").await?;
    bob.expect("*** leaving chat").await?;

    alice.finish().await?;
    bob.finish().await?;
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_client_name_fails() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("message_relay");
    let server = RelayServer::start(&binary).await?;

    let mut alice = Chat::join(&binary, "alice", &server.addr).await?;

    let mut second = client_command(&binary, "alice", &server.addr);
    let status = timeout(READ_TIMEOUT, second.status())
        .await
        .context("second alice did not exit in time")??;
    assert!(!status.success(), "second alice should be rejected");

    alice.type_line("/quit").await?;
    alice.finish().await?;
    server.stop().await;
    Ok(())
}

/// `message_relay serve` on an ephemeral loopback port.
struct RelayServer {
    child: Child,
    addr: String,
    logs: JoinHandle<()>,
}

impl RelayServer {
    async fn start(binary: &Path) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(["serve", "--addr", "127.0.0.1", "--port", "0"])
            .env("RUST_LOG", "info")
            .env("NO_COLOR", "1")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn server")?;
        let stdout = child.stdout.take().context("server stdout")?;
        let mut lines = BufReader::new(stdout).lines();

        // The first log line ends with the bound address.
        let banner = next_line(&mut lines).await?;
        let addr = match banner.split_whitespace().last() {
            Some(addr) if addr.contains(':') => addr.to_string(),
            _ => bail!("unexpected server banner: {banner}"),
        };

        // Keep reading dashboard output so the pipe never fills.
        let logs = tokio::spawn(async move {
            while let Ok(Some(_)) = lines.next_line().await {}
        });

        Ok(Self { child, addr, logs })
    }

    async fn stop(mut self) {
        let _ = self.child.kill().await;
        let _ = self.logs.await;
    }
}

/// A `message_relay client` driven through its stdin and stdout.
struct Chat {
    name: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Chat {
    async fn join(binary: &Path, name: &str, addr: &str) -> Result<Self> {
        let mut child = client_command(binary, name, addr)
            .spawn()
            .with_context(|| format!("failed to spawn client {name}"))?;
        let mut chat = Self {
            name: name.to_string(),
            stdin: child.stdin.take().context("client stdin")?,
            stdout: BufReader::new(child.stdout.take().context("client stdout")?).lines(),
            child,
        };
        chat.expect(&format!("*** connected as {name}")).await?;
        Ok(chat)
    }

    async fn type_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .with_context(|| format!("{} failed to type '{line}'", self.name))?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn expect(&mut self, expected: &str) -> Result<()> {
        let line = next_line(&mut self.stdout)
            .await
            .with_context(|| format!("{} waiting for '{expected}'", self.name))?;
        assert_eq!(line, expected, "unexpected output from {}", self.name);
        Ok(())
    }

    async fn finish(mut self) -> Result<()> {
        let status = timeout(READ_TIMEOUT, self.child.wait())
            .await
            .with_context(|| format!("{} did not exit", self.name))??;
        if !status.success() {
            bail!("{} exited with status {status}", self.name);
        }
        Ok(())
    }
}

fn client_command(binary: &Path, name: &str, addr: &str) -> Command {
    let mut cmd = Command::new(binary);
    cmd.args(["client", "--name", name, "--server", addr])
        .env("RUST_LOG", "warn")
        .env("NO_COLOR", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    cmd
}

async fn next_line(lines: &mut Lines<BufReader<ChildStdout>>) -> Result<String> {
    match timeout(READ_TIMEOUT, lines.next_line()).await {
        Ok(Ok(Some(line))) => Ok(line),
        Ok(Ok(None)) => bail!("stream closed"),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => bail!("timed out waiting for a line"),
    }
}
