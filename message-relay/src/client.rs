use std::collections::VecDeque;

use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{Request, Response, ServerFrame, Status, read_message, write_message},
};

/// A line typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Message { to: String, text: String },
    Contacts,
    Users,
    Add(String),
    Remove(String),
    Quit,
}

/// What an outstanding request's response should be rendered as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Contacts,
    Users,
    Ack,
}

pub fn parse_command(line: &str) -> Result<ClientCommand, String> {
    let line = line.trim();
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match command {
        "/msg" => match rest.split_once(' ') {
            Some((to, text)) if !text.trim().is_empty() => Ok(ClientCommand::Message {
                to: to.to_string(),
                text: text.trim().to_string(),
            }),
            _ => Err("usage: /msg <user> <text>".to_string()),
        },
        "/contacts" => Ok(ClientCommand::Contacts),
        "/users" => Ok(ClientCommand::Users),
        "/add" if !rest.is_empty() => Ok(ClientCommand::Add(rest.to_string())),
        "/del" if !rest.is_empty() => Ok(ClientCommand::Remove(rest.to_string())),
        "/add" | "/del" => Err(format!("usage: {command} <user>")),
        "/quit" => Ok(ClientCommand::Quit),
        other => Err(format!(
            "unknown command '{other}'; try /msg, /contacts, /users, /add, /del or /quit"
        )),
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!(server = %args.server, "connected");
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    register(&mut reader, &mut writer, &args.name).await?;
    print(Line::Out(format!("*** connected as {}", args.name))).await?;

    let mut pending = VecDeque::new();
    write_message(&mut writer, &Request::users_request(&args.name)).await?;
    pending.push_back(Pending::Users);
    write_message(&mut writer, &Request::get_contacts(&args.name)).await?;
    pending.push_back(Pending::Contacts);

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_client_loop(
        &mut reader,
        &mut writer,
        &mut stdin,
        &mut input,
        &args.name,
        &mut pending,
    )
    .await?;
    leave(&mut writer, &args.name).await;

    Ok(())
}

async fn register(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    name: &str,
) -> Result<()> {
    write_message(writer, &Request::presence(name)).await?;

    loop {
        match read_message::<_, ServerFrame>(reader).await? {
            Some(ServerFrame::Response(Response {
                status: Status::Ok,
                ..
            })) => return Ok(()),
            Some(ServerFrame::Response(response)) => {
                bail!(
                    "registration rejected: {}",
                    response.error.unwrap_or_default()
                )
            }
            Some(ServerFrame::Relay(request)) => print(render_relay(request)).await?,
            None => bail!("server closed the connection during registration"),
        }
    }
}

async fn run_client_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    name: &str,
    pending: &mut VecDeque<Pending>,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            server_frame = read_message::<_, ServerFrame>(reader) => {
                if !handle_server_frame(server_frame, pending).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, writer, name, pending).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_frame(
    frame: io::Result<Option<ServerFrame>>,
    pending: &mut VecDeque<Pending>,
) -> Result<bool> {
    match frame? {
        Some(ServerFrame::Relay(request)) => {
            print(render_relay(request)).await?;
            Ok(true)
        }
        Some(ServerFrame::Response(response)) => {
            let expected = pending.pop_front().unwrap_or(Pending::Ack);
            print(render_response(expected, response)).await?;
            Ok(true)
        }
        None => {
            print(Line::Out("*** server closed the connection".into())).await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    writer: &mut OwnedWriteHalf,
    name: &str,
    pending: &mut VecDeque<Pending>,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }
    if input.trim().is_empty() {
        return Ok(true);
    }

    let command = match parse_command(input) {
        Ok(command) => command,
        Err(usage) => {
            print(Line::Err(format!("!!! {usage}"))).await?;
            return Ok(true);
        }
    };

    let (request, expected) = match command {
        ClientCommand::Quit => {
            print(Line::Out("*** leaving chat".into())).await?;
            return Ok(false);
        }
        ClientCommand::Message { to, text } => (Request::send(name, &to, &text), None),
        ClientCommand::Contacts => (Request::get_contacts(name), Some(Pending::Contacts)),
        ClientCommand::Users => (Request::users_request(name), Some(Pending::Users)),
        ClientCommand::Add(contact) => (Request::add_contact(name, &contact), Some(Pending::Ack)),
        ClientCommand::Remove(contact) => {
            (Request::remove_contact(name, &contact), Some(Pending::Ack))
        }
    };

    write_message(writer, &request).await?;
    pending.extend(expected);
    Ok(true)
}

/// Tells the server we are leaving; failures only mean it is already gone.
async fn leave(writer: &mut OwnedWriteHalf, name: &str) {
    if let Err(error) = write_message(writer, &Request::exit(name)).await {
        warn!(?error, "failed to send exit");
    }
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

/// One line of terminal output.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Out(String),
    Err(String),
}

fn render_relay(request: Request) -> Line {
    match request {
        Request::Send { sender, text, .. } => Line::Out(format!("<{sender}> {text}")),
        other => Line::Err(format!("!!! unexpected {} frame", other.action())),
    }
}

fn render_response(expected: Pending, response: Response) -> Line {
    if response.status == Status::BadRequest {
        return Line::Err(format!("!!! {}", response.error.unwrap_or_default()));
    }

    let names = response.payload.unwrap_or_default();
    let listed = if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    };
    Line::Out(match expected {
        Pending::Contacts => format!("*** contacts: {listed}"),
        Pending::Users => format!("*** known users: {listed}"),
        Pending::Ack => "*** ok".to_string(),
    })
}

async fn print(line: Line) -> io::Result<()> {
    match line {
        Line::Out(text) => write_line(tokio::io::stdout(), &text).await,
        Line::Err(text) => write_line(tokio::io::stderr(), &text).await,
    }
}

async fn write_line<W: AsyncWrite + Unpin>(mut out: W, text: &str) -> io::Result<()> {
    out.write_all(format!("{text}\n").as_bytes()).await?;
    out.flush().await
}
