//! CLI commands for the tracker
//!
//! Implements all command handlers for the CLI interface.

use crate::core::{Network, Script};
use crate::derivation::{Feature, SchemeParser};
use crate::indexer::{Explorer, ExplorerConfig};
use crate::repository::KeyPathEntry;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn print_entry(entry: &KeyPathEntry, network: Network) {
    println!("   ├─ Key path: {}", entry.key_path);
    println!("   ├─ Script: {}", entry.script_pubkey.to_hex());
    if let Some(redeem) = &entry.redeem {
        println!("   ├─ Redeem: {}", redeem.to_hex());
    }
    println!(
        "   └─ Address: {}",
        entry.address(network).unwrap_or_else(|| "-".to_string())
    );
}

/// Show the parsed form of a scheme
pub fn cmd_inspect(network: Network, scheme: &str) -> CliResult<()> {
    let scheme = SchemeParser::new(network).parse(scheme)?;

    println!("🔎 Derivation scheme ({})", network);
    println!("   ├─ Canonical: {}", scheme);
    println!("   ├─ Script kind: {:?}", scheme.script_kind());
    if scheme.is_multisig() {
        println!(
            "   ├─ Threshold: {} of {}",
            scheme.threshold(),
            scheme.keys().len()
        );
    }
    let keys = scheme.keys();
    for (i, key) in keys.iter().enumerate() {
        let branch = if i + 1 == keys.len() { "└─" } else { "├─" };
        println!(
            "   {} Key {}: {} (fingerprint {})",
            branch,
            i,
            key.encode(network),
            hex::encode(key.fingerprint())
        );
    }
    Ok(())
}

/// Print a range of derived scripts without touching the store
pub fn cmd_derive(
    network: Network,
    scheme: &str,
    feature: &str,
    from: u32,
    count: u32,
) -> CliResult<()> {
    let scheme = SchemeParser::new(network).parse(scheme)?;
    let feature: Feature = feature.parse()?;
    let end = from.saturating_add(count);

    println!("🧮 {} {} [{}..{})", scheme, feature, from, end);
    for output in scheme.line(feature)?.derive_range(from..end)? {
        let entry = KeyPathEntry::from(output);
        println!("\n   #{}", entry.index());
        print_entry(&entry, network);
    }
    Ok(())
}

/// Start tracking a scheme
pub fn cmd_track(explorer: &Explorer, scheme: &str) -> CliResult<()> {
    let scheme = explorer.parse_scheme(scheme)?;
    explorer.track(&scheme)?;

    println!("✅ Tracking {}", scheme);
    for feature in Feature::ALL {
        if let Some(window) = explorer.repository().window(&scheme, feature)? {
            println!(
                "   ├─ {}: {} scripts, highest used {:?}",
                feature,
                window.generated_end(),
                window.highest_used
            );
        }
    }
    println!("   └─ Gap limit: {}", explorer.config().gap_limit);
    Ok(())
}

/// Stop tracking a scheme
pub fn cmd_untrack(explorer: &Explorer, scheme: &str) -> CliResult<()> {
    let scheme = explorer.parse_scheme(scheme)?;
    if explorer.untrack(&scheme)? {
        println!("🗑️  Untracked {}", scheme);
    } else {
        println!("⚠️  {} was not tracked", scheme);
    }
    Ok(())
}

/// List tracked schemes
pub fn cmd_list(explorer: &Explorer) -> CliResult<()> {
    let schemes = explorer.repository().tracked_schemes()?;
    if schemes.is_empty() {
        println!("📭 No tracked schemes");
        return Ok(());
    }

    println!("📋 Tracked schemes ({}):", schemes.len());
    for tracked in schemes {
        println!(
            "   • {} (since {})",
            tracked.scheme,
            tracked.tracked_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// Show the next unused entry
pub fn cmd_unused(explorer: &Explorer, scheme: &str, feature: &str, skip: usize) -> CliResult<()> {
    let scheme = explorer.parse_scheme(scheme)?;
    let feature: Feature = feature.parse()?;

    match explorer.get_unused(&scheme, feature, skip, false)? {
        Some(entry) => {
            println!("📬 Next unused {} script of {}", feature, scheme);
            print_entry(&entry, explorer.network());
        }
        None => {
            println!(
                "⚠️  No unused {} script within the gap limit ({})",
                feature,
                explorer.config().gap_limit
            );
        }
    }
    Ok(())
}

/// Look a script up in the index
pub fn cmd_lookup(explorer: &Explorer, script: &str) -> CliResult<()> {
    let script = Script::from_hex(script)?;

    match explorer.get_key_information(&script)? {
        Some(entry) => {
            println!("🔑 {}", entry.scheme);
            print_entry(&entry, explorer.network());
        }
        None => println!("❌ Script {} is not tracked", script.to_hex()),
    }
    Ok(())
}

/// Build the explorer for commands that need the store
pub fn open_explorer(config: ExplorerConfig) -> CliResult<Explorer> {
    Ok(Explorer::open(config)?)
}
