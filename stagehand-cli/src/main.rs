use clap::{Parser, Subcommand};
use stagehand_core::{Result, StagehandError, Tokenizer};
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Tokenizer tooling for split-model inference vocabularies")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode text into token ids
    Tokenize {
        /// Path to the binary vocabulary file
        vocab: PathBuf,

        /// Text to encode
        text: String,

        /// Number of BOS ids to prepend
        #[arg(long, default_value = "1")]
        bos: usize,

        /// Number of EOS ids to append
        #[arg(long, default_value = "1")]
        eos: usize,

        /// Print each id next to its piece
        #[arg(long)]
        pieces: bool,
    },

    /// Decode token ids back into text
    Detokenize {
        /// Path to the binary vocabulary file
        vocab: PathBuf,

        /// Token ids, separated by spaces or commas
        #[arg(required = true, num_args = 1..)]
        ids: Vec<String>,
    },

    /// Show vocabulary summary
    Inspect {
        /// Path to the binary vocabulary file
        vocab: PathBuf,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let result = match cli.command {
        Commands::Tokenize {
            vocab,
            text,
            bos,
            eos,
            pieces,
        } => cmd_tokenize(&vocab, &text, bos, eos, pieces),
        Commands::Detokenize { vocab, ids } => cmd_detokenize(&vocab, &ids),
        Commands::Inspect { vocab, json } => cmd_inspect(&vocab, json),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn load_vocab(path: &Path) -> Result<Tokenizer> {
    if !path.exists() {
        return Err(StagehandError::VocabularyLoad(format!(
            "file not found: {}",
            path.display()
        )));
    }
    Tokenizer::from_file(path)
}

fn cmd_tokenize(vocab: &Path, text: &str, bos: usize, eos: usize, pieces: bool) -> Result<()> {
    let tok = load_vocab(vocab)?;
    let start = Instant::now();
    let ids = tok.encode(text, bos, eos);
    tracing::debug!(
        tokens = ids.len(),
        elapsed_us = start.elapsed().as_micros() as u64,
        "encoded"
    );

    if pieces {
        for &id in &ids {
            let piece = tok.piece(id).unwrap_or_default();
            println!("{id:>8}  {}", String::from_utf8_lossy(piece).escape_debug());
        }
    } else {
        let joined: Vec<String> = ids.iter().map(u32::to_string).collect();
        println!("{}", joined.join(" "));
    }
    Ok(())
}

fn parse_ids(raw: &[String], vocab_size: usize) -> Result<Vec<u32>> {
    raw.iter()
        .flat_map(|arg| arg.split([',', ' ']))
        .filter(|s| !s.is_empty())
        .map(|s| {
            let id: u32 = s
                .trim()
                .parse()
                .map_err(|_| StagehandError::Config(format!("not a token id: {s:?}")))?;
            if id as usize >= vocab_size {
                return Err(StagehandError::OutOfRangeToken { id, vocab_size });
            }
            Ok(id)
        })
        .collect()
}

fn cmd_detokenize(vocab: &Path, raw: &[String]) -> Result<()> {
    let tok = load_vocab(vocab)?;
    let ids = parse_ids(raw, tok.vocab_size())?;
    println!("{}", tok.decode_all(&ids));
    Ok(())
}

fn cmd_inspect(vocab: &Path, json: bool) -> Result<()> {
    let tok = load_vocab(vocab)?;
    let byte_pieces = (0..tok.vocab_size() as u32)
        .filter_map(|id| tok.piece(id))
        .filter(|p| p.len() == 6 && p.starts_with(b"<0x") && p.ends_with(b">"))
        .count();
    let piece_text = |id: u32| {
        tok.piece(id)
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default()
    };

    if json {
        let summary = serde_json::json!({
            "path": vocab.display().to_string(),
            "vocab_size": tok.vocab_size(),
            "bos_id": tok.bos_id(),
            "bos_piece": piece_text(tok.bos_id()),
            "eos_id": tok.eos_id(),
            "eos_piece": piece_text(tok.eos_id()),
            "max_piece_len": tok.max_piece_len(),
            "byte_pieces": byte_pieces,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("vocabulary: {}", vocab.display());
    println!("  size:          {}", tok.vocab_size());
    println!("  bos:           {} {:?}", tok.bos_id(), piece_text(tok.bos_id()));
    println!("  eos:           {} {:?}", tok.eos_id(), piece_text(tok.eos_id()));
    println!("  max piece len: {}", tok.max_piece_len());
    println!("  byte pieces:   {byte_pieces}");
    Ok(())
}
