use std::path::Path;

use anyhow::anyhow;
use base64::{Engine as _, engine::general_purpose};
use accelerboat_api::models::{
    TorrentAction as ApiTorrentAction, TorrentCreateRequest, TorrentDetail, TorrentListResponse,
    TorrentSelectionRequest,
};
use accelerboat_torrent_core::{FilePriority, FilePriorityOverride};
use serde::Deserialize;
use uuid::Uuid;

use crate::cli::{
    ActionType, OutputFormat, TorrentActionArgs, TorrentAddArgs, TorrentListArgs,
    TorrentRemoveArgs, TorrentSelectArgs, TorrentStatusArgs,
};
use crate::client::{AppContext, CliError, CliResult, HEADER_API_KEY, classify_problem};
use crate::output::{render_torrent_detail, render_torrent_list};

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FilePriorityOverrideArg {
    pub index: u32,
    pub priority: FilePriority,
}

pub(crate) async fn handle_torrent_add(ctx: &AppContext, args: TorrentAddArgs) -> CliResult<()> {
    let creds = ctx.api_key.as_ref().ok_or_else(|| {
        CliError::validation("API key is required (pass --api-key or set REVAER_API_KEY)")
    })?;

    let id = args.id.unwrap_or_else(Uuid::new_v4);
    let source = args.source.trim();
    if source.is_empty() {
        return Err(CliError::validation("source must not be empty"));
    }

    let mut request = TorrentCreateRequest {
        id,
        magnet: None,
        metainfo: None,
        name: args.name,
        download_dir: None,
        sequential: None,
        start_paused: None,
        seed_mode: None,
        hash_check_sample_pct: None,
        super_seeding: None,
        include: Vec::new(),
        exclude: Vec::new(),
        skip_fluff: false,
        tags: Vec::new(),
        trackers: Vec::new(),
        replace_trackers: false,
        web_seeds: Vec::new(),
        replace_web_seeds: false,
        max_download_bps: None,
        max_upload_bps: None,
        max_connections: None,
        seed_ratio_limit: None,
        seed_time_limit: None,
        auto_managed: None,
        queue_position: None,
        pex_enabled: None,
    };

    if source.starts_with("magnet:") {
        request.magnet = Some(source.to_string());
    } else {
        let path = Path::new(source);
        let bytes = std::fs::read(path).map_err(|err| {
            CliError::failure(anyhow!(
                "failed to read torrent file '{}': {err}",
                path.display()
            ))
        })?;
        request.metainfo = Some(general_purpose::STANDARD.encode(&bytes));
        if request.name.is_none() {
            request.name = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string);
        }
    }

    let url = ctx
        .base_url
        .join("/v1/torrents")
        .map_err(|err| CliError::failure(anyhow!("invalid base URL: {err}")))?;

    let response = ctx
        .client
        .post(url)
        .header(HEADER_API_KEY, creds.header_value())
        .json(&request)
        .send()
        .await
        .map_err(|err| CliError::failure(anyhow!("request to /v1/torrents failed: {err}")))?;

    if response.status().is_success() {
        println!("Torrent submission requested (id: {id})");
        Ok(())
    } else {
        Err(classify_problem(response).await)
    }
}

pub(crate) async fn handle_torrent_remove(
    ctx: &AppContext,
    args: TorrentRemoveArgs,
) -> CliResult<()> {
    let creds = ctx.api_key.as_ref().ok_or_else(|| {
        CliError::validation("API key is required (pass --api-key or set REVAER_API_KEY)")
    })?;
    let id = args.id;

    let url = ctx
        .base_url
        .join(&format!("/v1/torrents/{id}/action"))
        .map_err(|err| CliError::failure(anyhow!("invalid base URL: {err}")))?;

    let response = ctx
        .client
        .post(url)
        .header(HEADER_API_KEY, creds.header_value())
        .json(&ApiTorrentAction::Remove { delete_data: false })
        .send()
        .await
        .map_err(|err| {
            CliError::failure(anyhow!("request to /v1/torrents/{id}/action failed: {err}"))
        })?;

    if response.status().is_success() {
        println!("Torrent removal requested (id: {id})");
        Ok(())
    } else {
        Err(classify_problem(response).await)
    }
}

pub(crate) async fn handle_torrent_list(
    ctx: &AppContext,
    args: TorrentListArgs,
    output: OutputFormat,
) -> CliResult<()> {
    let mut url = ctx
        .base_url
        .join("/v1/torrents")
        .map_err(|err| CliError::failure(anyhow!("invalid base URL: {err}")))?;

    {
        let mut pairs = url.query_pairs_mut();
        if let Some(limit) = args.limit {
            pairs.append_pair("limit", &limit.to_string());
        }
        if let Some(cursor) = &args.cursor {
            pairs.append_pair("cursor", cursor);
        }
        if let Some(state) = &args.state {
            pairs.append_pair("state", state);
        }
        if let Some(tracker) = &args.tracker {
            pairs.append_pair("tracker", tracker);
        }
        if let Some(extension) = &args.extension {
            pairs.append_pair("extension", extension);
        }
        if let Some(tags) = &args.tags {
            pairs.append_pair("tags", tags);
        }
        if let Some(name) = &args.name {
            pairs.append_pair("name", name);
        }
    }

    let response = ctx
        .client
        .get(url)
        .send()
        .await
        .map_err(|err| CliError::failure(anyhow!("request to /v1/torrents failed: {err}")))?;

    if response.status().is_success() {
        let list = response
            .json::<TorrentListResponse>()
            .await
            .map_err(|err| CliError::failure(anyhow!("failed to parse torrent list: {err}")))?;
        render_torrent_list(&list, output)?;
        Ok(())
    } else {
        Err(classify_problem(response).await)
    }
}

pub(crate) async fn handle_torrent_status(
    ctx: &AppContext,
    args: TorrentStatusArgs,
    output: OutputFormat,
) -> CliResult<()> {
    let url = ctx
        .base_url
        .join(&format!("/v1/torrents/{}", args.id))
        .map_err(|err| CliError::failure(anyhow!("invalid base URL: {err}")))?;
    let response = ctx.client.get(url.as_ref()).send().await.map_err(|err| {
        CliError::failure(anyhow!("request to /v1/torrents/{{id}} failed: {err}"))
    })?;

    if response.status().is_success() {
        let detail = response
            .json::<TorrentDetail>()
            .await
            .map_err(|err| CliError::failure(anyhow!("failed to parse torrent detail: {err}")))?;
        render_torrent_detail(&detail, output)?;
        Ok(())
    } else {
        Err(classify_problem(response).await)
    }
}

pub(crate) async fn handle_torrent_select(
    ctx: &AppContext,
    args: TorrentSelectArgs,
) -> CliResult<()> {
    let creds = ctx.api_key.as_ref().ok_or_else(|| {
        CliError::validation("API key is required (pass --api-key or set REVAER_API_KEY)")
    })?;

    let mut request = TorrentSelectionRequest {
        include: args.include.clone(),
        exclude: args.exclude.clone(),
        skip_fluff: Some(args.skip_fluff),
        priorities: Vec::new(),
    };
    for entry in &args.priorities {
        request.priorities.push(FilePriorityOverride {
            index: entry.index,
            priority: entry.priority,
        });
    }

    let url = ctx
        .base_url
        .join(&format!("/v1/torrents/{}/select", args.id))
        .map_err(|err| CliError::failure(anyhow!("invalid base URL: {err}")))?;

    let response = ctx
        .client
        .post(url)
        .header(HEADER_API_KEY, creds.header_value())
        .json(&request)
        .send()
        .await
        .map_err(|err| {
            CliError::failure(anyhow!(
                "request to /v1/torrents/{{id}}/select failed: {err}"
            ))
        })?;

    if response.status().is_success() {
        println!("Selection update accepted (id: {})", args.id);
        Ok(())
    } else {
        Err(classify_problem(response).await)
    }
}

pub(crate) async fn handle_torrent_action(
    ctx: &AppContext,
    args: TorrentActionArgs,
) -> CliResult<()> {
    let creds = ctx.api_key.as_ref().ok_or_else(|| {
        CliError::validation("API key is required (pass --api-key or set REVAER_API_KEY)")
    })?;

    let action_payload = build_action_payload(&args)?;

    let url = ctx
        .base_url
        .join(&format!("/v1/torrents/{}/action", args.id))
        .map_err(|err| CliError::failure(anyhow!("invalid base URL: {err}")))?;

    let response = ctx
        .client
        .post(url)
        .header(HEADER_API_KEY, creds.header_value())
        .json(&action_payload)
        .send()
        .await
        .map_err(|err| {
            CliError::failure(anyhow!(
                "request to /v1/torrents/{{id}}/action failed: {err}"
            ))
        })?;

    if response.status().is_success() {
        println!("Action dispatched (id: {})", args.id);
        Ok(())
    } else {
        Err(classify_problem(response).await)
    }
}

pub(crate) fn build_action_payload(args: &TorrentActionArgs) -> CliResult<ApiTorrentAction> {
    let action = match args.action {
        ActionType::Pause => ApiTorrentAction::Pause,
        ActionType::Resume => ApiTorrentAction::Resume,
        ActionType::Remove => ApiTorrentAction::Remove {
            delete_data: args.delete_data,
        },
        ActionType::Reannounce => ApiTorrentAction::Reannounce,
        ActionType::Recheck => ApiTorrentAction::Recheck,
        ActionType::Sequential => {
            let enable = args.enable.ok_or_else(|| {
                CliError::validation("--enable must be provided for sequential action")
            })?;
            ApiTorrentAction::Sequential { enable }
        }
        ActionType::Rate => {
            if args.download.is_none() && args.upload.is_none() {
                return Err(CliError::validation(
                    "provide --download and/or --upload when action=rate",
                ));
            }
            ApiTorrentAction::Rate {
                download_bps: args.download,
                upload_bps: args.upload,
            }
        }
    };
    Ok(action)
}

pub(crate) fn parse_priority_override(value: &str) -> Result<FilePriorityOverrideArg, String> {
    let (index_str, priority_str) = value
        .split_once('=')
        .ok_or_else(|| "expected format index=priority".to_string())?;
    let index = index_str
        .trim()
        .parse::<u32>()
        .map_err(|_| "index must be an integer".to_string())?;
    let priority = match priority_str.trim().to_ascii_lowercase().as_str() {
        "skip" => FilePriority::Skip,
        "low" => FilePriority::Low,
        "normal" => FilePriority::Normal,
        "high" => FilePriority::High,
        other => return Err(format!("unknown priority '{other}'")),
    };
    Ok(FilePriorityOverrideArg { index, priority })
}
