use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use cli_table::{Cell, CellStruct, Style, Table, format::Justify, print_stdout};

use crate::cli::PeerArgs;
use crate::config::{Settings, process_env};
use crate::folder::FolderManager;
use crate::selection::{
    CandidateFilter, FixedSelection, QuerySelection, SelectionProvider, candidate_label,
    rank_candidates,
};
use crate::transfer::mirror::MirrorClient;
use crate::transfer::{Credentials, PeerSession, SessionReport, TransferClient, run_session};
use crate::util;

/// Download flags after clap parsing.
#[derive(Debug, Default, Clone)]
pub struct DownloadArgs {
    pub queries: Option<PathBuf>,
    pub items: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub max_time: Option<u64>,
    pub expire_retries: Option<u32>,
    pub fail_retries: Option<u32>,
    pub out: Option<PathBuf>,
    pub burn: bool,
    pub open: bool,
    pub discard: bool,
    pub json: bool,
    pub quiet: bool,
}

fn credentials(settings: &Settings, peer: &PeerArgs) -> Result<Credentials> {
    Ok(settings.credentials(peer.username.clone(), peer.password.clone(), process_env)?)
}

/// Fold command-line overrides into the loaded settings.
pub fn apply_overrides(mut settings: Settings, args: &DownloadArgs) -> Settings {
    if let Some(c) = args.concurrency {
        settings.download_concurrency = c;
    }
    if let Some(t) = args.max_time {
        settings.max_download_time_secs = t;
    }
    if let Some(n) = args.expire_retries {
        settings.max_expire_retries = n;
    }
    if let Some(n) = args.fail_retries {
        settings.max_fail_retries = n;
    }
    if let Some(out) = &args.out {
        settings.download_base = Some(out.clone());
    }
    settings
}

pub fn handle_check(settings: &Settings, peer: &PeerArgs) -> Result<()> {
    let creds = credentials(settings, peer)?;
    MirrorClient::new(&peer.mirror)
        .connect(&creds)
        .with_context(|| format!("cannot log in as {}", creds.username))?;
    util::info(&format!("Connected as {}", creds.username));
    Ok(())
}

pub fn handle_search(
    settings: &Settings,
    peer: &PeerArgs,
    query: &[String],
    search_ms: Option<u64>,
    any_bitrate: bool,
) -> Result<()> {
    let creds = credentials(settings, peer)?;
    let session = MirrorClient::new(&peer.mirror).connect(&creds)?;
    let query = query.join(" ");
    let duration = search_ms.map(Duration::from_millis).unwrap_or_else(|| settings.search_duration());
    let results = session
        .search(&query, duration)
        .map_err(|e| anyhow::anyhow!("search '{}' failed: {}", query, e))?;
    let filter = CandidateFilter { bitrate: if any_bitrate { None } else { Some(320) }, ..Default::default() };
    let ranked = rank_candidates(results, &filter);
    if ranked.is_empty() {
        util::error(&format!("No results for '{}'", query));
        return Ok(());
    }
    let title = vec![
        "#".cell().bold(true),
        "Track".cell().bold(true),
        "Size".cell().bold(true),
        "Path".cell().bold(true),
        "Speed".cell().bold(true),
    ];
    let rows: Vec<Vec<CellStruct>> = ranked
        .iter()
        .enumerate()
        .map(|(i, c)| {
            tracing::debug!("[search] {}", candidate_label(c));
            vec![
                (i + 1).cell().justify(Justify::Right),
                c.display_name().cell(),
                util::human_bytes(c.size).cell().justify(Justify::Right),
                c.file.clone().cell(),
                c.speed.cell().justify(Justify::Right),
            ]
        })
        .collect();
    print_stdout(rows.table().title(title)).context("cannot print results")?;
    Ok(())
}

fn selection_for(settings: &Settings, args: &DownloadArgs) -> Result<Box<dyn SelectionProvider>> {
    if let Some(path) = &args.items {
        return Ok(Box::new(FixedSelection::from_json_file(path)?));
    }
    let Some(path) = &args.queries else {
        bail!("nothing to download: pass --queries <file> or --items <file>");
    };
    let sel = QuerySelection::from_file(path, settings.search_duration())?;
    if sel.queries().is_empty() {
        bail!("{} contains no queries", path.display());
    }
    Ok(Box::new(sel))
}

/// Run a download session for the given peer and return its report.
pub fn run_download(settings: &Settings, peer: &PeerArgs, args: &DownloadArgs) -> Result<SessionReport> {
    let settings = apply_overrides(settings.clone(), args);
    let creds = credentials(&settings, peer)?;
    let selection = selection_for(&settings, args)?;
    let folder = match &settings.download_base {
        Some(base) => FolderManager::new(base, env!("CARGO_PKG_NAME")),
        None => FolderManager::in_current_dir()?,
    };
    let options = settings.session_options(!args.quiet && !args.json);
    let client = MirrorClient::new(&peer.mirror);
    let report = run_session(&client, selection.as_ref(), &creds, folder, &options)?;
    Ok(report)
}

pub fn handle_download(settings: &Settings, peer: &PeerArgs, args: &DownloadArgs) -> Result<()> {
    let report = run_download(settings, peer, args)?;
    util::print_summary(&report, args.json);
    if !args.json {
        util::print_abandoned_table(&report.abandoned);
    }
    if let Some(dir) = util::logs_dir()
        && let Some(path) = util::write_abandoned_jsonl(&dir, &report.abandoned)
    {
        tracing::info!("abandoned items written to {}", path.display());
    }

    let Some(folder) = report.folder.as_ref() else {
        return Ok(());
    };
    // 先刻录再删除，否则刻录的是空目录
    if args.burn {
        if report.downloaded == 0 {
            util::error("Nothing downloaded, skipping burn");
        } else {
            crate::post::burn_folder(folder)?;
        }
    }
    if args.open && !args.discard {
        crate::post::open_folder(folder)?;
    }
    if args.discard {
        crate::post::remove_folder(folder)?;
        util::info(&format!("Removed {}", folder.display()));
    }
    Ok(())
}
