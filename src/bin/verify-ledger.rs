use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgAction, Command};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use audit_ledger::audit::merkle::verify_merkle_root;
use audit_ledger::audit::store::{self, RetentionAnchor};
use audit_ledger::audit::verify::{ChainWalker, RangeVerification};
use audit_ledger::crypto::verify_with_public_key_pem;

fn main() -> Result<()> {
    let matches = Command::new("verify-ledger")
        .version("0.1.0")
        .about("Independently verify an audit ledger file with only its public key")
        .arg(
            Arg::new("ledger")
                .short('l')
                .long("ledger")
                .value_name("PATH")
                .help("Path to the JSONL ledger file")
                .required(true),
        )
        .arg(
            Arg::new("public-key")
                .short('k')
                .long("public-key")
                .value_name("PEM")
                .help("Path to the ledger public key (SPKI PEM)")
                .required(true),
        )
        .arg(
            Arg::new("anchors")
                .short('a')
                .long("anchors")
                .value_name("PATH")
                .help("Retention anchors file (defaults to <ledger>.anchors.jsonl)"),
        )
        .arg(
            Arg::new("archive")
                .long("archive")
                .value_name("PATH")
                .help("Archived JSONL of purged entries to check against the anchor digests"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Print every entry and broken link"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");

    let level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let ledger_path = PathBuf::from(
        matches
            .get_one::<String>("ledger")
            .ok_or_else(|| anyhow!("--ledger is required"))?,
    );
    let key_path = matches
        .get_one::<String>("public-key")
        .ok_or_else(|| anyhow!("--public-key is required"))?;
    let anchors_path = matches
        .get_one::<String>("anchors")
        .map(PathBuf::from)
        .unwrap_or_else(|| store::anchors_path(&ledger_path));

    let public_key_pem = std::fs::read_to_string(key_path)
        .with_context(|| format!("Failed to read public key {}", key_path))?;
    let anchors = store::read_anchors(&anchors_path)?;

    let report = verify_ledger_file(&ledger_path, &public_key_pem, anchors.clone())?;
    if !quiet {
        print_report(&report, verbose);
    }

    let mut valid = report.chain_valid && report.all_verified;

    if let Some(archive) = matches.get_one::<String>("archive") {
        match verify_archive(Path::new(archive), &anchors) {
            Ok(matched) => {
                if !quiet {
                    println!("✓ Archive matches {} retention anchor(s)", matched);
                }
            }
            Err(e) => {
                error!("Archive verification failed: {}", e);
                valid = false;
            }
        }
    }

    if !valid {
        error!("Ledger verification failed");
        std::process::exit(1);
    }

    if !quiet {
        println!("✓ Ledger verification completed successfully");
    }
    Ok(())
}

fn verify_ledger_file(
    ledger_path: &Path,
    public_key_pem: &str,
    anchors: Vec<RetentionAnchor>,
) -> Result<RangeVerification> {
    info!("Verifying ledger: {:?}", ledger_path);

    if !ledger_path.exists() {
        return Err(anyhow!("Ledger file not found: {:?}", ledger_path));
    }

    let mut walker = ChainWalker::new(anchors);
    let stats = store::for_each_entry(ledger_path, 0, |entry| {
        let signature_valid = verify_with_public_key_pem(public_key_pem, &entry.hash, &entry.signature);
        walker.check(&entry, signature_valid);
        ControlFlow::Continue(())
    })?;
    walker.unparsable(stats.unparsable);

    Ok(walker.finish(false))
}

/// Check that the archived entries reproduce the span digest of every
/// anchor they cover. Returns the number of anchors matched.
fn verify_archive(archive: &Path, anchors: &[RetentionAnchor]) -> Result<usize> {
    let mut archived = Vec::new();
    let stats = store::for_each_entry(archive, 0, |entry| {
        archived.push(entry);
        ControlFlow::Continue(())
    })?;
    if let Some(bad) = stats.unparsable.first() {
        return Err(anyhow!(
            "Archive {:?} has {} unparsable line(s), first at line {}",
            archive,
            stats.unparsable.len(),
            bad.line
        ));
    }
    if archived.is_empty() {
        return Err(anyhow!("Archive {:?} holds no entries", archive));
    }

    let mut matched = 0;
    for anchor in anchors {
        let hashes: Vec<String> = archived
            .iter()
            .filter(|e| e.sequence >= anchor.first_sequence && e.sequence <= anchor.last_sequence)
            .map(|e| e.hash.clone())
            .collect();
        if hashes.is_empty() {
            continue;
        }
        if hashes.len() != anchor.removed_count {
            return Err(anyhow!(
                "Anchor #{}..#{} removed {} entries but the archive holds {}",
                anchor.first_sequence,
                anchor.last_sequence,
                anchor.removed_count,
                hashes.len()
            ));
        }
        if !verify_merkle_root(&hashes, &anchor.span_digest)? {
            return Err(anyhow!(
                "Span digest mismatch for anchor #{}..#{}",
                anchor.first_sequence,
                anchor.last_sequence
            ));
        }
        matched += 1;
    }

    if matched == 0 {
        return Err(anyhow!("Archive does not cover any retention anchor"));
    }
    Ok(matched)
}

fn print_report(report: &RangeVerification, verbose: bool) {
    println!("{}", report.summary());

    if verbose {
        for detail in &report.verification_details {
            println!(
                "  #{} {} hash:{} signature:{} link:{}",
                detail.sequence,
                detail.log_id,
                mark(detail.hash_matches),
                mark(detail.signature_valid),
                mark(detail.link_valid.unwrap_or(true)),
            );
        }
    }

    for link in &report.broken_links {
        println!(
            "  ✗ #{} {} {:?}: expected {}, found {}",
            link.sequence,
            link.log_id,
            link.reason,
            link.expected.as_deref().unwrap_or("null"),
            link.actual.as_deref().unwrap_or("null"),
        );
    }
    for line in &report.unparsable_lines {
        println!(
            "  ✗ line {} (byte {}) is not a ledger entry: {}",
            line.line, line.byte_offset, line.error
        );
    }
    if let Some(sequence) = report.first_invalid_sequence {
        println!("  Chain invalid from sequence {}", sequence);
    }
}

fn mark(ok: bool) -> &'static str {
    if ok {
        "✓"
    } else {
        "✗"
    }
}
