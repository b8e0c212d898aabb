use anyhow::anyhow;
use accelerboat_api::models::{SetupCompleteResponse, SetupStartRequest, SetupStartResponse};
use accelerboat_config::{ApiKeyPatch, AppMode, ConfigSnapshot, SecretPatch, SettingsChangeset};
use std::io::{self, IsTerminal};
use std::net::IpAddr;
use std::path::Path;

use crate::cli::{SetupCompleteArgs, SetupStartArgs};
use crate::client::{
    AppContext, CliError, CliResult, HEADER_SETUP_TOKEN, classify_problem, random_string,
};

pub(crate) async fn handle_setup_start(ctx: &AppContext, args: SetupStartArgs) -> CliResult<()> {
    let url = ctx
        .base_url
        .join("/admin/setup/start")
        .map_err(|err| CliError::failure(anyhow!("invalid base URL: {err}")))?;

    let mut request = ctx.client.post(url);

    if args.issued_by.is_some() || args.ttl_seconds.is_some() {
        let payload = SetupStartRequest {
            issued_by: args.issued_by,
            ttl_seconds: args.ttl_seconds,
        };
        request = request.json(&payload);
    }

    let response = request
        .send()
        .await
        .map_err(|err| CliError::failure(anyhow!("request to /admin/setup/start failed: {err}")))?;

    if response.status().is_success() {
        let body = response.json::<SetupStartResponse>().await.map_err(|err| {
            CliError::failure(anyhow!("failed to parse setup start response: {err}"))
        })?;
        println!("{}", body.token);
        println!("expires_at: {}", body.expires_at);
        Ok(())
    } else {
        Err(classify_problem(response).await)
    }
}

pub(crate) async fn handle_setup_complete(
    ctx: &AppContext,
    args: SetupCompleteArgs,
) -> CliResult<()> {
    let token = args
        .token
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            CliError::validation("setup token is required (flag --token or REVAER_SETUP_TOKEN)")
        })?;

    let bind_addr: IpAddr = args
        .bind
        .parse()
        .map_err(|_| CliError::validation("bind address must be a valid IP address"))?;

    if !bind_addr.is_loopback() {
        return Err(CliError::validation(
            "setup mode must bind to a loopback address",
        ));
    }

    if args.port == 0 {
        return Err(CliError::validation("port must be between 1 and 65535"));
    }

    let passphrase = resolve_passphrase(&args)?;

    let resume_dir = path_to_string(&args.resume_dir)?;
    let download_root = path_to_string(&args.download_root)?;
    let library_root = path_to_string(&args.library_root)?;

    let snapshot = fetch_well_known_snapshot(ctx).await?;

    let api_key_id = args.api_key_id.clone().unwrap_or_else(|| random_string(24));
    let api_key_secret = random_string(48);

    let mut app_profile = snapshot.app_profile;
    app_profile.instance_name = args.instance;
    app_profile.bind_addr = bind_addr;
    app_profile.http_port = i32::from(args.port);
    app_profile.mode = AppMode::Active;

    let mut engine_profile = snapshot.engine_profile;
    engine_profile.implementation = "libtorrent".to_string();
    engine_profile.resume_dir.clone_from(&resume_dir);
    engine_profile.download_root.clone_from(&download_root);

    let fs_policy = build_fs_policy_patch(
        snapshot.fs_policy,
        &library_root,
        &download_root,
        &resume_dir,
    );

    let changeset = SettingsChangeset {
        app_profile: Some(app_profile),
        engine_profile: Some(engine_profile),
        fs_policy: Some(fs_policy),
        api_keys: vec![ApiKeyPatch::Upsert {
            key_id: api_key_id.clone(),
            label: Some(args.api_key_label.clone()),
            enabled: Some(true),
            expires_at: None,
            secret: Some(api_key_secret.clone()),
            rate_limit: None,
        }],
        secrets: vec![SecretPatch::Set {
            name: "encryption_passphrase".to_string(),
            value: passphrase,
        }],
    };

    let url = ctx
        .base_url
        .join("/admin/setup/complete")
        .map_err(|err| CliError::failure(anyhow!("invalid base URL: {err}")))?;

    let response = ctx
        .client
        .post(url)
        .header(HEADER_SETUP_TOKEN, token)
        .json(&changeset)
        .send()
        .await
        .map_err(|err| {
            CliError::failure(anyhow!("request to /admin/setup/complete failed: {err}"))
        })?;

    if response.status().is_success() {
        let body = response
            .json::<SetupCompleteResponse>()
            .await
            .map_err(|err| {
                CliError::failure(anyhow!("failed to parse setup completion response: {err}"))
            })?;
        let instance_name = &body.snapshot.app_profile.instance_name;
        println!("Setup complete for instance '{instance_name}'.");
        if let Some(api_key) = body.api_key {
            println!("API key created (store securely): {api_key}");
        } else {
            println!("No API key issued (auth disabled).");
        }
        Ok(())
    } else {
        Err(classify_problem(response).await)
    }
}

async fn fetch_well_known_snapshot(ctx: &AppContext) -> CliResult<ConfigSnapshot> {
    let url = ctx
        .base_url
        .join("/.well-known/accelerboat.json")
        .map_err(|err| CliError::failure(anyhow!("invalid base URL: {err}")))?;

    let response = ctx.client.get(url).send().await.map_err(|err| {
        CliError::failure(anyhow!("request to /.well-known/accelerboat.json failed: {err}"))
    })?;

    if response.status().is_success() {
        response
            .json::<ConfigSnapshot>()
            .await
            .map_err(|err| CliError::failure(anyhow!("failed to parse well-known snapshot: {err}")))
    } else {
        Err(classify_problem(response).await)
    }
}

fn path_to_string(path: &Path) -> CliResult<String> {
    path.to_str().map(str::to_string).ok_or_else(|| {
        CliError::validation(format!("path '{}' is not valid UTF-8", path.display()))
    })
}

pub(crate) fn build_fs_policy_patch(
    mut policy: accelerboat_config::FsPolicy,
    library_root: &str,
    download_root: &str,
    resume_dir: &str,
) -> accelerboat_config::FsPolicy {
    let mut allow_paths = vec![download_root.to_string(), library_root.to_string()];
    if !allow_paths.iter().any(|p| p == resume_dir) {
        allow_paths.push(resume_dir.to_string());
    }

    policy.library_root = library_root.to_string();
    policy.allow_paths = allow_paths;
    policy
}

pub(crate) fn resolve_passphrase(args: &SetupCompleteArgs) -> CliResult<String> {
    if let Some(value) = &args.passphrase {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(CliError::validation("passphrase cannot be empty"));
        }
        return Ok(trimmed.to_string());
    }

    if io::stdin().is_terminal() {
        let pass = rpassword::prompt_password("Encryption passphrase: ").map_err(|err| {
            CliError::failure(anyhow!("failed to read passphrase from stdin: {err}"))
        })?;
        let trimmed = pass.trim();
        if trimmed.is_empty() {
            return Err(CliError::validation("passphrase cannot be empty"));
        }
        Ok(trimmed.to_string())
    } else {
        Err(CliError::validation(
            "passphrase required; supply via --passphrase when running non-interactively",
        ))
    }
}
