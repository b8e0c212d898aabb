//! Torrent route handlers and workflow integration.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path as AxumPath, Query, State},
    http::StatusCode,
};
use base64::{Engine as _, engine::general_purpose};
use tracing::{error, info};
use uuid::Uuid;

use crate::app::state::ApiState;
use crate::http::constants::{DEFAULT_PAGE_SIZE, MAX_METAINFO_BYTES, MAX_PAGE_SIZE};
use crate::http::errors::ApiError;
use crate::models::{
    TorrentAction, TorrentAuthorRequest, TorrentAuthorResponse, TorrentCreateRequest,
    TorrentDetail, TorrentLabelEntry, TorrentListResponse, TorrentOptionsRequest, TorrentPeer,
    TorrentSelectionRequest, TorrentStateKind, TorrentSummary, TorrentTrackersRemoveRequest,
    TorrentTrackersRequest, TorrentTrackersResponse, TorrentWebSeedsRequest, TrackerView,
};
use accelerboat_events::Event as CoreEvent;
use accelerboat_torrent_core::model::TorrentTrackersUpdate;
use accelerboat_torrent_core::{
    AddTorrent, FileSelectionUpdate, RemoveTorrent, TorrentLabelPolicy, TorrentRateLimit,
    TorrentSource, TorrentStatus,
};

use super::{
    CursorToken, StatusEntry, TorrentHandles, TorrentListQuery, TorrentMetadata,
    decode_cursor_token, detail_from_components, encode_cursor_from_entry, normalise_lower,
    normalize_trackers, normalize_web_seeds, parse_state_filter, split_comma_separated,
    summary_from_components,
};
use crate::http::torrents::labels::{
    TorrentLabelCatalog, apply_label_policies, load_label_catalog, normalize_label_name,
    update_label_catalog,
};

pub(crate) async fn create_torrent(
    State(state): State<Arc<ApiState>>,
    Extension(context): Extension<crate::http::auth::AuthContext>,
    Json(request): Json<TorrentCreateRequest>,
) -> Result<StatusCode, ApiError> {
    match context {
        crate::http::auth::AuthContext::ApiKey { .. } => {}
        crate::http::auth::AuthContext::SetupToken(_) => {
            return Err(ApiError::unauthorized(
                "setup authentication context cannot manage torrents",
            ));
        }
    }

    let trackers = normalize_trackers(&request.trackers)?;
    let web_seeds = normalize_web_seeds(&request.web_seeds)?;

    let add_request =
        dispatch_torrent_add(state.as_ref(), &request, trackers.clone(), web_seeds).await?;
    state.set_metadata(
        request.id,
        TorrentMetadata::from_options(&add_request.options),
    );
    let torrent_name = request.name.as_deref().unwrap_or("<unspecified>");
    info!(torrent_id = %request.id, torrent_name = %torrent_name, "torrent submission requested");
    state.update_torrent_metrics().await;

    Ok(StatusCode::ACCEPTED)
}

pub(crate) async fn create_torrent_authoring(
    State(state): State<Arc<ApiState>>,
    Extension(context): Extension<crate::http::auth::AuthContext>,
    Json(request): Json<TorrentAuthorRequest>,
) -> Result<Json<TorrentAuthorResponse>, ApiError> {
    match context {
        crate::http::auth::AuthContext::ApiKey { .. } => {}
        crate::http::auth::AuthContext::SetupToken(_) => {
            return Err(ApiError::unauthorized(
                "setup authentication context cannot manage torrents",
            ));
        }
    }

    if request.root_path.trim().is_empty() {
        return Err(ApiError::bad_request("root_path is required"));
    }

    let trackers = normalize_trackers(&request.trackers)?;
    let web_seeds = normalize_web_seeds(&request.web_seeds)?;
    if request.private && trackers.is_empty() {
        return Err(ApiError::bad_request(
            "private torrents require at least one tracker",
        ));
    }

    let mut core_request = request.to_core();
    core_request.trackers = trackers;
    core_request.web_seeds = web_seeds;
    core_request.piece_length = request.piece_length.filter(|value| *value > 0);

    let handles = state
        .torrent
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("torrent workflow not configured"))?;
    let result = handles
        .workflow()
        .create_torrent(core_request)
        .await
        .map_err(|err| {
            error!(error = %err, "failed to author torrent");
            ApiError::bad_request(err.to_string())
        })?;
    Ok(Json(TorrentAuthorResponse::from_core(result)))
}

pub(crate) async fn list_torrent_categories(
    State(state): State<Arc<ApiState>>,
    Extension(context): Extension<crate::http::auth::AuthContext>,
) -> Result<Json<Vec<TorrentLabelEntry>>, ApiError> {
    let _ = require_api_key(context)?;
    let catalog = load_label_catalog(state.as_ref()).await?;
    let mut entries: Vec<TorrentLabelEntry> = catalog
        .categories
        .into_iter()
        .map(|(name, policy)| TorrentLabelEntry { name, policy })
        .collect();
    entries.sort_by(|left, right| left.name.cmp(&right.name));
    Ok(Json(entries))
}

pub(crate) async fn upsert_torrent_category(
    State(state): State<Arc<ApiState>>,
    Extension(context): Extension<crate::http::auth::AuthContext>,
    AxumPath(name): AxumPath<String>,
    Json(policy): Json<TorrentLabelPolicy>,
) -> Result<Json<TorrentLabelEntry>, ApiError> {
    let key_id = require_api_key(context)?;
    let normalized = normalize_label_name("category", &name)?;
    let catalog = update_label_catalog(
        state.as_ref(),
        &key_id,
        "torrent_category_upsert",
        |catalog| catalog.upsert_category(&normalized, policy),
    )
    .await?;
    let policy = catalog
        .categories
        .get(&normalized)
        .cloned()
        .ok_or_else(|| ApiError::internal("failed to persist torrent category"))?;
    Ok(Json(TorrentLabelEntry {
        name: normalized,
        policy,
    }))
}

pub(crate) async fn list_torrent_tags(
    State(state): State<Arc<ApiState>>,
    Extension(context): Extension<crate::http::auth::AuthContext>,
) -> Result<Json<Vec<TorrentLabelEntry>>, ApiError> {
    let _ = require_api_key(context)?;
    let catalog = load_label_catalog(state.as_ref()).await?;
    let mut entries: Vec<TorrentLabelEntry> = catalog
        .tags
        .into_iter()
        .map(|(name, policy)| TorrentLabelEntry { name, policy })
        .collect();
    entries.sort_by(|left, right| left.name.cmp(&right.name));
    Ok(Json(entries))
}

pub(crate) async fn upsert_torrent_tag(
    State(state): State<Arc<ApiState>>,
    Extension(context): Extension<crate::http::auth::AuthContext>,
    AxumPath(name): AxumPath<String>,
    Json(policy): Json<TorrentLabelPolicy>,
) -> Result<Json<TorrentLabelEntry>, ApiError> {
    let key_id = require_api_key(context)?;
    let normalized = normalize_label_name("tag", &name)?;
    let catalog = update_label_catalog(state.as_ref(), &key_id, "torrent_tag_upsert", |catalog| {
        catalog.upsert_tag(&normalized, policy)
    })
    .await?;
    let policy = catalog
        .tags
        .get(&normalized)
        .cloned()
        .ok_or_else(|| ApiError::internal("failed to persist torrent tag"))?;
    Ok(Json(TorrentLabelEntry {
        name: normalized,
        policy,
    }))
}

pub(crate) async fn delete_torrent(
    State(state): State<Arc<ApiState>>,
    Extension(context): Extension<crate::http::auth::AuthContext>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<StatusCode, ApiError> {
    match context {
        crate::http::auth::AuthContext::ApiKey { .. } => {}
        crate::http::auth::AuthContext::SetupToken(_) => {
            return Err(ApiError::unauthorized(
                "setup authentication context cannot manage torrents",
            ));
        }
    }

    dispatch_torrent_remove(state.torrent.as_ref(), id).await?;
    info!(torrent_id = %id, "torrent removal requested");
    state.remove_metadata(&id);
    state.update_torrent_metrics().await;
    let _ = state
        .events
        .publish(CoreEvent::TorrentRemoved { torrent_id: id });
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn select_torrent(
    State(state): State<Arc<ApiState>>,
    Extension(context): Extension<crate::http::auth::AuthContext>,
    AxumPath(id): AxumPath<Uuid>,
    Json(request): Json<TorrentSelectionRequest>,
) -> Result<StatusCode, ApiError> {
    match context {
        crate::http::auth::AuthContext::ApiKey { .. } => {}
        crate::http::auth::AuthContext::SetupToken(_) => {
            return Err(ApiError::unauthorized(
                "setup authentication context cannot manage torrents",
            ));
        }
    }

    let handles = state
        .torrent
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("torrent workflow not configured"))?;
    let update: FileSelectionUpdate = request.clone().into();
    let metadata_selection = update.clone();
    handles
        .workflow()
        .update_selection(id, update)
        .await
        .map_err(|err| {
            error!(error = %err, torrent_id = %id, "failed to update torrent selection");
            ApiError::internal("failed to update torrent selection")
        })?;
    info!(torrent_id = %id, "torrent selection update requested");
    state.update_metadata(&id, |metadata| {
        metadata.selection = metadata_selection;
    });
    Ok(StatusCode::ACCEPTED)
}

pub(crate) async fn update_torrent_trackers(
    State(state): State<Arc<ApiState>>,
    Extension(context): Extension<crate::http::auth::AuthContext>,
    AxumPath(id): AxumPath<Uuid>,
    Json(request): Json<TorrentTrackersRequest>,
) -> Result<StatusCode, ApiError> {
    match context {
        crate::http::auth::AuthContext::ApiKey { .. } => {}
        crate::http::auth::AuthContext::SetupToken(_) => {
            return Err(ApiError::unauthorized(
                "setup authentication context cannot manage torrents",
            ));
        }
    }

    if request.is_empty() {
        return Err(ApiError::bad_request("no trackers supplied"));
    }

    let trackers = normalize_trackers(&request.trackers)?;
    let handles = state
        .torrent
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("torrent workflow not configured"))?;
    let update = request.to_update(trackers.clone());
    handles
        .workflow()
        .update_trackers(id, update)
        .await
        .map_err(|err| {
            error!(error = %err, torrent_id = %id, "failed to update trackers");
            ApiError::internal("failed to update trackers")
        })?;

    state.update_metadata(&id, |metadata| {
        let mut merged = if request.replace {
            Vec::new()
        } else {
            metadata.trackers.clone()
        };
        let mut seen: HashSet<String> = merged.iter().cloned().collect();
        for tracker in trackers {
            if seen.insert(tracker.clone()) {
                merged.push(tracker);
            }
        }
        metadata.trackers = merged;
        metadata.replace_trackers = request.replace;
        if request.replace {
            metadata
                .tracker_messages
                .retain(|tracker, _| metadata.trackers.contains(tracker));
        }
    });
    info!(torrent_id = %id, "torrent tracker update requested");
    Ok(StatusCode::ACCEPTED)
}

pub(crate) async fn list_torrent_trackers(
    State(state): State<Arc<ApiState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Json<TorrentTrackersResponse>, ApiError> {
    let metadata = state.get_metadata(&id);
    let trackers = metadata
        .trackers
        .iter()
        .map(|url| TrackerView {
            url: url.clone(),
            status: None,
            message: metadata.tracker_messages.get(url).cloned(),
        })
        .collect();
    Ok(Json(TorrentTrackersResponse { trackers }))
}

pub(crate) async fn list_torrent_peers(
    State(state): State<Arc<ApiState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Json<Vec<TorrentPeer>>, ApiError> {
    let handles = state
        .torrent
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("torrent workflow not configured"))?;
    let peers = handles.inspector().peers(id).await.map_err(|err| {
        error!(error = %err, torrent_id = %id, "failed to fetch torrent peers");
        ApiError::internal("failed to fetch torrent peers")
    })?;
    Ok(Json(peers.into_iter().map(TorrentPeer::from).collect()))
}

pub(crate) async fn remove_torrent_trackers(
    State(state): State<Arc<ApiState>>,
    Extension(context): Extension<crate::http::auth::AuthContext>,
    AxumPath(id): AxumPath<Uuid>,
    Json(request): Json<TorrentTrackersRemoveRequest>,
) -> Result<StatusCode, ApiError> {
    match context {
        crate::http::auth::AuthContext::ApiKey { .. } => {}
        crate::http::auth::AuthContext::SetupToken(_) => {
            return Err(ApiError::unauthorized(
                "setup authentication context cannot manage torrents",
            ));
        }
    }

    if request.trackers.is_empty() {
        return Err(ApiError::bad_request("no trackers provided for removal"));
    }

    let removal = normalize_trackers(&request.trackers)?;
    let removal_set: HashSet<String> = removal.into_iter().collect();
    let metadata = state.get_metadata(&id);
    let retained = metadata
        .trackers
        .iter()
        .filter(|url| !removal_set.contains(*url))
        .cloned()
        .collect::<Vec<_>>();

    let handles = state
        .torrent
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("torrent workflow not configured"))?;
    handles
        .workflow()
        .update_trackers(
            id,
            TorrentTrackersUpdate {
                trackers: retained.clone(),
                replace: true,
            },
        )
        .await
        .map_err(|err| {
            error!(error = %err, torrent_id = %id, "failed to remove trackers");
            ApiError::internal("failed to remove trackers")
        })?;
    state.update_metadata(&id, |metadata| {
        metadata.trackers.clone_from(&retained);
        metadata.replace_trackers = true;
        metadata
            .tracker_messages
            .retain(|tracker, _| retained.contains(tracker));
    });
    info!(torrent_id = %id, removed = removal_set.len(), "torrent trackers removed");
    Ok(StatusCode::ACCEPTED)
}

pub(crate) async fn update_torrent_web_seeds(
    State(state): State<Arc<ApiState>>,
    Extension(context): Extension<crate::http::auth::AuthContext>,
    AxumPath(id): AxumPath<Uuid>,
    Json(request): Json<TorrentWebSeedsRequest>,
) -> Result<StatusCode, ApiError> {
    match context {
        crate::http::auth::AuthContext::ApiKey { .. } => {}
        crate::http::auth::AuthContext::SetupToken(_) => {
            return Err(ApiError::unauthorized(
                "setup authentication context cannot manage torrents",
            ));
        }
    }

    if request.is_empty() {
        return Err(ApiError::bad_request("no web seeds supplied"));
    }

    let web_seeds = normalize_web_seeds(&request.web_seeds)?;
    let handles = state
        .torrent
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("torrent workflow not configured"))?;
    let update = request.to_update(web_seeds.clone());
    handles
        .workflow()
        .update_web_seeds(id, update)
        .await
        .map_err(|err| {
            error!(error = %err, torrent_id = %id, "failed to update web seeds");
            ApiError::internal("failed to update web seeds")
        })?;

    state.update_metadata(&id, |metadata| {
        let mut merged = if request.replace {
            Vec::new()
        } else {
            metadata.web_seeds.clone()
        };
        let mut seen: HashSet<String> = merged.iter().cloned().collect();
        for seed in web_seeds {
            if seen.insert(seed.clone()) {
                merged.push(seed);
            }
        }
        metadata.web_seeds = merged;
        metadata.replace_web_seeds = request.replace;
    });
    info!(torrent_id = %id, "torrent web seed update requested");
    Ok(StatusCode::ACCEPTED)
}

pub(crate) async fn update_torrent_options(
    State(state): State<Arc<ApiState>>,
    Extension(context): Extension<crate::http::auth::AuthContext>,
    AxumPath(id): AxumPath<Uuid>,
    Json(request): Json<TorrentOptionsRequest>,
) -> Result<StatusCode, ApiError> {
    match context {
        crate::http::auth::AuthContext::ApiKey { .. } => {}
        crate::http::auth::AuthContext::SetupToken(_) => {
            return Err(ApiError::unauthorized(
                "setup authentication context cannot manage torrents",
            ));
        }
    }

    if request.is_empty() {
        return Err(ApiError::bad_request("no torrent options provided"));
    }

    if let Some(message) = request.unsupported_metadata_message() {
        return Err(ApiError::bad_request(message));
    }

    if let Some(message) = request.unsupported_seed_limit_message() {
        return Err(ApiError::bad_request(message));
    }

    let handles = state
        .torrent
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("torrent workflow not configured"))?;
    let update = request.to_update();
    handles
        .workflow()
        .update_options(id, update.clone())
        .await
        .map_err(|err| {
            error!(error = %err, torrent_id = %id, "failed to update torrent options");
            ApiError::internal("failed to update torrent options")
        })?;
    state.update_metadata(&id, |metadata| {
        if let Some(limit) = update.connections_limit {
            metadata.connections_limit = Some(limit);
        }
        if let Some(pex_enabled) = update.pex_enabled {
            metadata.pex_enabled = Some(pex_enabled);
        }
        if let Some(super_seeding) = update.super_seeding {
            metadata.super_seeding = Some(super_seeding);
        }
        if let Some(auto_managed) = update.auto_managed {
            metadata.auto_managed = Some(auto_managed);
        }
        if let Some(queue_position) = update.queue_position {
            metadata.queue_position = Some(queue_position);
        }
    });
    info!(torrent_id = %id, "torrent options update requested");
    Ok(StatusCode::ACCEPTED)
}

pub(crate) async fn action_torrent(
    State(state): State<Arc<ApiState>>,
    Extension(context): Extension<crate::http::auth::AuthContext>,
    AxumPath(id): AxumPath<Uuid>,
    Json(action): Json<TorrentAction>,
) -> Result<StatusCode, ApiError> {
    match context {
        crate::http::auth::AuthContext::ApiKey { .. } => {}
        crate::http::auth::AuthContext::SetupToken(_) => {
            return Err(ApiError::unauthorized(
                "setup authentication context cannot manage torrents",
            ));
        }
    }

    let handles = state
        .torrent
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("torrent workflow not configured"))?;
    let workflow = handles.workflow();

    let result = match &action {
        TorrentAction::Pause => workflow.pause_torrent(id).await,
        TorrentAction::Resume => workflow.resume_torrent(id).await,
        TorrentAction::Remove { delete_data } => {
            let options = RemoveTorrent {
                with_data: *delete_data,
            };
            workflow.remove_torrent(id, options).await
        }
        TorrentAction::Reannounce => workflow.reannounce(id).await,
        TorrentAction::Recheck => workflow.recheck(id).await,
        TorrentAction::Sequential { enable } => workflow.set_sequential(id, *enable).await,
        TorrentAction::Rate {
            download_bps,
            upload_bps,
        } => {
            workflow
                .update_limits(
                    Some(id),
                    TorrentRateLimit {
                        download_bps: *download_bps,
                        upload_bps: *upload_bps,
                    },
                )
                .await
        }
        TorrentAction::Move { download_dir } => {
            let trimmed = download_dir.trim();
            if trimmed.is_empty() {
                return Err(ApiError::bad_request(
                    "download_dir must be provided for move action",
                ));
            }
            workflow.move_torrent(id, trimmed.to_string()).await
        }
        TorrentAction::PieceDeadline { piece, deadline_ms } => {
            workflow
                .set_piece_deadline(
                    id,
                    accelerboat_torrent_core::model::PieceDeadline {
                        piece: *piece,
                        deadline_ms: *deadline_ms,
                    },
                )
                .await
        }
    };

    result.map_err(|err| {
        error!(error = %err, torrent_id = %id, "torrent action failed");
        ApiError::internal("failed to execute torrent action")
    })?;

    if let TorrentAction::Rate {
        download_bps,
        upload_bps,
    } = action
    {
        let limits = TorrentRateLimit {
            download_bps,
            upload_bps,
        };
        state.update_metadata(&id, |metadata| {
            metadata.apply_rate_limit(&limits);
        });
    } else if let TorrentAction::Move {
        download_dir: ref dir,
    } = action
    {
        state.update_metadata(&id, |metadata| {
            metadata.download_dir = Some(dir.clone());
        });
    }

    if matches!(action, TorrentAction::Remove { .. }) {
        state.remove_metadata(&id);
    }
    info!(torrent_id = %id, action = ?action, "torrent action dispatched");
    Ok(StatusCode::ACCEPTED)
}

pub(crate) async fn fetch_all_torrents(
    handles: &TorrentHandles,
) -> Result<Vec<TorrentStatus>, ApiError> {
    handles.inspector().list().await.map_err(|err| {
        error!(error = %err, "failed to read torrent catalogue");
        ApiError::internal("failed to query torrent status")
    })
}

pub(crate) async fn fetch_torrent_status(
    handles: &TorrentHandles,
    id: Uuid,
) -> Result<TorrentStatus, ApiError> {
    handles
        .inspector()
        .get(id)
        .await
        .map_err(|err| {
            error!(error = %err, "failed to load torrent status");
            ApiError::internal("failed to query torrent status")
        })?
        .ok_or_else(|| ApiError::not_found("torrent not found"))
}

pub(crate) async fn list_torrents(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TorrentListQuery>,
) -> Result<Json<TorrentListResponse>, ApiError> {
    let handles = state
        .torrent
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("torrent workflow not configured"))?;
    let statuses = fetch_all_torrents(handles).await?;
    state.record_torrent_metrics(&statuses);

    let filters = parse_list_filters(&query)?;
    let mut entries = build_status_entries(statuses, &state);
    filter_entries(&mut entries, &filters);
    sort_entries(&mut entries);

    let cursor = query
        .cursor
        .as_ref()
        .map(|token| decode_cursor_token(token))
        .transpose()?;
    let limit = query
        .limit
        .map_or(DEFAULT_PAGE_SIZE, |value| value as usize)
        .clamp(1, MAX_PAGE_SIZE);
    let start_index = compute_start_index(&entries, cursor.as_ref());
    let (torrents, next) = paginate_entries(&entries, start_index, limit)?;

    Ok(Json(TorrentListResponse { torrents, next }))
}

pub(crate) async fn get_torrent(
    State(state): State<Arc<ApiState>>,
    AxumPath(id): AxumPath<Uuid>,
) -> Result<Json<TorrentDetail>, ApiError> {
    let handles = state
        .torrent
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("torrent workflow not configured"))?;
    let status = fetch_torrent_status(handles, id).await?;
    state.record_torrent_metrics(std::slice::from_ref(&status));
    let metadata = state.get_metadata(&status.id);
    Ok(Json(detail_from_components(status, metadata)))
}

struct ListFilters {
    state: Option<TorrentStateKind>,
    tags: HashSet<String>,
    tracker: Option<String>,
    extension: Option<String>,
    name: Option<String>,
}

fn parse_list_filters(query: &TorrentListQuery) -> Result<ListFilters, ApiError> {
    let state = match query.state.as_deref() {
        Some(filter) => Some(parse_state_filter(filter)?),
        None => None,
    };
    let tags = query
        .tags
        .as_deref()
        .map(split_comma_separated)
        .unwrap_or_default()
        .into_iter()
        .map(|tag| tag.to_lowercase())
        .filter(|tag| !tag.is_empty())
        .collect::<HashSet<_>>();
    let tracker = query.tracker.as_ref().map(|value| normalise_lower(value));
    let extension = query
        .extension
        .as_ref()
        .map(|value| normalise_lower(value.trim_start_matches('.')));
    let name = query.name.as_ref().map(|value| normalise_lower(value));

    Ok(ListFilters {
        state,
        tags,
        tracker,
        extension,
        name,
    })
}

fn build_status_entries(statuses: Vec<TorrentStatus>, state: &Arc<ApiState>) -> Vec<StatusEntry> {
    statuses
        .into_iter()
        .map(|status| StatusEntry {
            metadata: state.get_metadata(&status.id),
            status,
        })
        .collect()
}

fn filter_entries(entries: &mut Vec<StatusEntry>, filters: &ListFilters) {
    entries.retain(|entry| {
        if let Some(expected_state) = filters.state {
            let current = TorrentStateKind::from(entry.status.state.clone());
            if current != expected_state {
                return false;
            }
        }

        if !filters.tags.is_empty() {
            let tags = entry
                .metadata
                .tags
                .iter()
                .map(|tag| tag.to_lowercase())
                .collect::<HashSet<_>>();
            if !filters.tags.iter().all(|needle| tags.contains(needle)) {
                return false;
            }
        }

        if let Some(tracker) = &filters.tracker {
            let matches_tracker = entry
                .metadata
                .trackers
                .iter()
                .any(|value| value.to_lowercase().contains(tracker));
            if !matches_tracker {
                return false;
            }
        }

        if let Some(extension) = &filters.extension {
            let matches_extension = entry.status.files.as_ref().is_some_and(|files| {
                files.iter().any(|file| {
                    file.path
                        .rsplit_once('.')
                        .is_some_and(|(_, ext)| normalise_lower(ext) == *extension)
                })
            });
            if !matches_extension {
                return false;
            }
        }

        if let Some(name) = &filters.name {
            let matched = entry
                .status
                .name
                .as_ref()
                .is_some_and(|value| value.to_lowercase().contains(name));
            if !matched {
                return false;
            }
        }

        true
    });
}

fn sort_entries(entries: &mut [StatusEntry]) {
    entries.sort_by(|a, b| {
        b.status
            .last_updated
            .cmp(&a.status.last_updated)
            .then_with(|| a.status.id.cmp(&b.status.id))
    });
}

fn compute_start_index(entries: &[StatusEntry], cursor: Option<&CursorToken>) -> usize {
    let mut index = 0;
    if let Some(cursor) = cursor {
        while index < entries.len() {
            let status = &entries[index].status;
            if status.last_updated > cursor.last_updated
                || (status.last_updated == cursor.last_updated && status.id >= cursor.id)
            {
                index += 1;
            } else {
                break;
            }
        }
    }
    index
}

fn paginate_entries(
    entries: &[StatusEntry],
    start_index: usize,
    limit: usize,
) -> Result<(Vec<TorrentSummary>, Option<String>), ApiError> {
    let end_index = (start_index + limit).min(entries.len());
    let slice = &entries[start_index..end_index];
    let torrents = slice
        .iter()
        .map(|entry| summary_from_components(entry.status.clone(), entry.metadata.clone()))
        .collect::<Vec<_>>();

    let next = if end_index < entries.len() && !torrents.is_empty() {
        Some(encode_cursor_from_entry(&entries[end_index - 1])?)
    } else {
        None
    };

    Ok((torrents, next))
}

pub(crate) async fn dispatch_torrent_add(
    state: &ApiState,
    request: &TorrentCreateRequest,
    trackers: Vec<String>,
    web_seeds: Vec<String>,
) -> Result<AddTorrent, ApiError> {
    let catalog = if request.category.is_some() || !request.tags.is_empty() {
        Some(load_label_catalog(state).await?)
    } else {
        None
    };
    dispatch_torrent_add_with_catalog(state, request, trackers, web_seeds, catalog.as_ref()).await
}

pub(in crate::http) async fn dispatch_torrent_add_with_catalog(
    state: &ApiState,
    request: &TorrentCreateRequest,
    trackers: Vec<String>,
    web_seeds: Vec<String>,
    catalog: Option<&TorrentLabelCatalog>,
) -> Result<AddTorrent, ApiError> {
    let handles = state
        .torrent
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("torrent workflow not configured"))?;

    let add_request = build_add_torrent(request, trackers, web_seeds, catalog)?;

    handles
        .workflow()
        .add_torrent(add_request.clone())
        .await
        .map_err(|err| {
            error!(error = %err, "failed to add torrent through workflow");
            ApiError::internal("failed to add torrent")
        })?;

    Ok(add_request)
}

pub(crate) async fn dispatch_torrent_remove(
    handles: Option<&TorrentHandles>,
    id: Uuid,
) -> Result<(), ApiError> {
    let handles =
        handles.ok_or_else(|| ApiError::service_unavailable("torrent workflow not configured"))?;

    handles
        .workflow()
        .remove_torrent(id, RemoveTorrent::default())
        .await
        .map_err(|err| {
            error!(error = %err, "failed to remove torrent through workflow");
            ApiError::internal("failed to remove torrent")
        })
}

fn build_add_torrent(
    request: &TorrentCreateRequest,
    trackers: Vec<String>,
    web_seeds: Vec<String>,
    catalog: Option<&TorrentLabelCatalog>,
) -> Result<AddTorrent, ApiError> {
    let magnet = request
        .magnet
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());

    let metainfo_bytes = if let Some(encoded) = &request.metainfo {
        let bytes = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| ApiError::bad_request("metainfo payload must be base64 encoded"))?;
        if bytes.len() > MAX_METAINFO_BYTES {
            return Err(ApiError::bad_request(
                "metainfo payload exceeds the 5 MiB limit",
            ));
        }
        Some(bytes)
    } else {
        None
    };

    if request.seed_ratio_limit.is_some() {
        return Err(ApiError::bad_request(
            "seed_ratio_limit overrides are not supported per-torrent",
        ));
    }

    if request.seed_time_limit.is_some() {
        return Err(ApiError::bad_request(
            "seed_time_limit overrides are not supported per-torrent",
        ));
    }

    if let Some(sample_pct) = request.hash_check_sample_pct {
        if sample_pct > 100 {
            return Err(ApiError::bad_request(
                "hash_check_sample_pct must be between 0 and 100",
            ));
        }
        if sample_pct > 0 && !matches!(request.seed_mode, Some(true)) {
            return Err(ApiError::bad_request(
                "hash_check_sample_pct requires seed_mode to be enabled",
            ));
        }
    }

    if let Some(position) = request.queue_position
        && position < 0
    {
        return Err(ApiError::bad_request(
            "queue_position must be zero or a positive integer",
        ));
    }

    if matches!(request.private, Some(true)) && request.replace_trackers && trackers.is_empty() {
        return Err(ApiError::bad_request(
            "private torrents require at least one tracker when replace_trackers is enabled",
        ));
    }

    let prefer_metainfo =
        matches!(request.seed_mode, Some(true)) || request.hash_check_sample_pct.unwrap_or(0) > 0;

    let source = if prefer_metainfo {
        match metainfo_bytes.clone() {
            Some(bytes) => TorrentSource::metainfo(bytes),
            None => {
                return Err(ApiError::bad_request(
                    "seed_mode/hash_check_sample_pct requires a metainfo payload",
                ));
            }
        }
    } else if let Some(magnet) = magnet {
        TorrentSource::magnet(magnet.to_string())
    } else if let Some(bytes) = metainfo_bytes {
        TorrentSource::metainfo(bytes)
    } else {
        return Err(ApiError::bad_request(
            "either magnet or metainfo payload must be provided",
        ));
    };

    let mut options = request.to_options();
    options.trackers = trackers;
    options.replace_trackers = request.replace_trackers;
    options.web_seeds = web_seeds;
    options.replace_web_seeds = request.replace_web_seeds;
    if let Some(catalog) = catalog {
        apply_label_policies(catalog, &mut options);
    }

    Ok(AddTorrent {
        id: request.id,
        source,
        options,
    })
}

fn require_api_key(context: crate::http::auth::AuthContext) -> Result<String, ApiError> {
    match context {
        crate::http::auth::AuthContext::ApiKey { key_id } => Ok(key_id),
        crate::http::auth::AuthContext::SetupToken(_) => Err(ApiError::unauthorized(
            "setup authentication context cannot manage torrents",
        )),
    }
}
