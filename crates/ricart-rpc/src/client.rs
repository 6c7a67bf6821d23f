//! Fortune client: one-shot commands and the interactive loop.

use anyhow::Result;
use ricart_core::{FortuneStub, PeerStub};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const MENU: &str = "\
Choose one of the following commands:
    r            ::  read a random fortune from the database,
    w <FORTUNE>  ::  write a new fortune into the database,
    s            ::  show the lock status of the peer,
    h            ::  print this menu,
    q            ::  exit.";

/// One line of interactive input.
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Read,
    Write(&'a str),
    Status,
    Help,
    Quit,
    Unknown,
}

fn parse_command(line: &str) -> Command<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    match line {
        "r" => Command::Read,
        "s" => Command::Status,
        "h" => Command::Help,
        "q" => Command::Quit,
        _ => match line.strip_prefix('w') {
            Some(rest) if rest.starts_with([' ', '\t']) => Command::Write(rest.trim()),
            _ => Command::Unknown,
        },
    }
}

pub async fn read(addr: SocketAddr) -> Result<()> {
    match FortuneStub::new(addr).read().await? {
        Some(fortune) => println!("{}", fortune),
        None => println!("(the database is empty)"),
    }
    Ok(())
}

pub async fn write(addr: SocketAddr, fortune: &str) -> Result<()> {
    FortuneStub::new(addr).write(fortune).await?;
    Ok(())
}

pub async fn status(addr: SocketAddr) -> Result<()> {
    let status = PeerStub::new(addr).display_status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Menu-driven session against the peer at `addr`.
///
/// Failed commands are reported and the session continues.
pub async fn interactive(addr: SocketAddr) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    println!("{}", MENU);

    loop {
        stdout.write_all(b"Command> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let outcome = match parse_command(&line) {
            Command::Read => read(addr).await,
            Command::Write(fortune) => write(addr, fortune).await,
            Command::Status => status(addr).await,
            Command::Help => {
                println!("{}", MENU);
                Ok(())
            }
            Command::Quit => break,
            Command::Unknown => {
                println!("Unknown command, type h for help.");
                Ok(())
            }
        };
        if let Err(e) = outcome {
            println!("Error: {}", e);
        }
    }
    Ok(())
}
