//! Decode a captured pagestream.
//!
//! The input is the raw bytes of one direction of a pagestream connection, i.e.
//! requests or responses back to back as they were sent.

use std::collections::BTreeMap;
use std::io::Cursor;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use pageserver_api::models::{PagestreamBeMessage, PagestreamFeMessage};
use utils::logging::{self, LogFormat};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help(true))]
struct Cli {
    /// Format of the log output: plain, json or test
    #[arg(long, default_value = "plain")]
    log_format: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode requests sent by the compute
    Requests(DumpArgs),
    /// Decode responses sent by the page server
    Responses(DumpArgs),
}

#[derive(Args)]
struct DumpArgs {
    /// Capture file
    path: Utf8PathBuf,
    /// Print the number of messages of each kind instead of the messages
    #[arg(long, default_value_t = false)]
    summary: bool,
}

#[derive(Clone, Copy)]
enum Direction {
    Requests,
    Responses,
}

struct Decoded {
    kind: &'static str,
    text: String,
}

fn decode_all(data: &[u8], direction: Direction) -> anyhow::Result<Vec<Decoded>> {
    let mut cursor = Cursor::new(data);
    let mut messages = Vec::new();
    while (cursor.position() as usize) < data.len() {
        let offset = cursor.position();
        let decoded = match direction {
            Direction::Requests => PagestreamFeMessage::parse(&mut cursor).map(|msg| Decoded {
                kind: msg.kind().into(),
                text: msg.to_string(),
            }),
            Direction::Responses => PagestreamBeMessage::parse(&mut cursor).map(|msg| Decoded {
                kind: msg.kind(),
                text: msg.to_string(),
            }),
        }
        .with_context(|| format!("could not decode message at offset {offset}"))?;
        messages.push(decoded);
    }
    Ok(messages)
}

fn summarize(messages: &[Decoded]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for msg in messages {
        *counts.entry(msg.kind).or_insert(0) += 1;
    }
    counts
}

fn dump(args: &DumpArgs, direction: Direction) -> anyhow::Result<()> {
    let data = std::fs::read(&args.path).with_context(|| format!("could not read {}", args.path))?;
    let messages = decode_all(&data, direction)
        .with_context(|| format!("could not decode {}", args.path))?;
    tracing::info!("decoded {} messages from {}", messages.len(), args.path);

    if args.summary {
        for (kind, count) in summarize(&messages) {
            println!("{kind}: {count}");
        }
    } else {
        for msg in &messages {
            println!("{}", msg.text);
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(
        LogFormat::from_config(&cli.log_format)?,
        logging::Output::Stderr,
    )?;
    match &cli.command {
        Command::Requests(args) => dump(args, Direction::Requests),
        Command::Responses(args) => dump(args, Direction::Responses),
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, BytesMut};
    use pageserver_api::models::*;
    use pageserver_api::reltag::RelTag;
    use utils::lsn::Lsn;

    use super::*;

    fn nblocks(relnode: u32) -> PagestreamFeMessage {
        PagestreamFeMessage::Nblocks(PagestreamNblocksRequest {
            hdr: PagestreamRequestHeader::latest(Lsn(0x10)),
            rel: RelTag {
                spcnode: 1663,
                dbnode: 5,
                relnode,
                forknum: 0,
            },
        })
    }

    #[test]
    fn decode_capture() {
        let mut capture = BytesMut::new();
        capture.put(nblocks(1).serialize());
        capture.put(nblocks(2).serialize());
        capture.put(
            PagestreamFeMessage::DbSize(PagestreamDbSizeRequest {
                hdr: PagestreamRequestHeader::at_lsn(Lsn(0x10)),
                dbnode: 5,
            })
            .serialize(),
        );

        let messages = decode_all(&capture, Direction::Requests).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].text, nblocks(2).to_string());

        let counts = summarize(&messages);
        assert_eq!(counts.get("Nblocks"), Some(&2));
        assert_eq!(counts.get("DbSize"), Some(&1));
    }

    #[test]
    fn decode_error_names_offset() {
        let mut capture = BytesMut::new();
        capture.put(
            PagestreamBeMessage::DbSize(PagestreamDbSizeResponse { db_size: 8192 }).serialize(),
        );
        capture.put_u8(0x42);

        let err = match decode_all(&capture, Direction::Responses) {
            Ok(_) => panic!("decoding garbage succeeded"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("at offset 9"), "{err:#}");
    }
}
