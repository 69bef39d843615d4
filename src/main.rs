//! CLI entry point for triton-pssh.
//!
//! Wires the configuration, metadata caches, instance pipeline, filter
//! evaluator, and the SSH worker pool together, then prints per-host
//! results in completion order.

use std::io::{IsTerminal, Write};
use std::process;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use triton_pssh::cli::{self, Cli, CliError};
use triton_pssh::ssh::auth;
use triton_pssh::{
    CacheConfig, CacheLayout, CloudClient, Context, Evaluator, ImageCache, NetworkCache,
    PipelineConfig, PrintMode, RestClient, SshConfig, SshSession, instance_context,
    stream_instances,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("triton-pssh: {err}");
            1
        }
    };
    process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<i32, CliError> {
    let mut ssh_config =
        SshConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    cli.apply_to(&mut ssh_config);
    ssh_config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    ensure_output_directory(&ssh_config.out_directory)?;
    ensure_output_directory(&ssh_config.err_directory)?;

    let mut cache_config =
        CacheConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    if cli.no_cache {
        cache_config.no_cache = true;
    }

    let base_url = std::env::var("SDC_URL").map_err(|_| {
        CliError::Config(String::from("missing provider endpoint: SDC_URL undefined"))
    })?;
    let authorization = std::env::var("SDC_AUTH_HEADER").unwrap_or_default();
    let client: Arc<dyn CloudClient> = Arc::new(RestClient::new(base_url, authorization));

    let layout = CacheLayout::from_env();
    let images = ImageCache::new(
        Arc::clone(&client),
        layout.clone(),
        cache_config.image_ttl(),
        cache_config.no_cache,
    );
    let networks = NetworkCache::new(
        Arc::clone(&client),
        layout.clone(),
        cache_config.network_ttl(),
        cache_config.no_cache,
    );

    let (filter, command) = cli::split_filter_and_command(&cli.args)?;
    let evaluator = Evaluator::parse(&filter)?;

    let mut auth_methods = Vec::new();
    for identity in &cli.identities {
        match auth::private_key_from_file(Utf8Path::new(identity)) {
            Ok(Some(method)) => auth_methods.push(method),
            Ok(None) => warn!(key = %identity, "identity file not found"),
            Err(err) => warn!(key = %identity, error = %err, "skipping unusable identity"),
        }
    }
    auth_methods.extend(auth::default_methods());

    let staged_stdin = stage_stdin()?;
    let stdin_path = staged_stdin.as_ref().map(|(_, path)| path.clone());

    let parallelism = ssh_config.effective_parallelism();
    let inline_output = ssh_config.inline_output;
    let session = SshSession::new(ssh_config, parallelism);
    let print_mode = cli.print.map(PrintMode::from);

    let mut stream = stream_instances(
        Arc::clone(&client),
        images.clone(),
        networks.clone(),
        PipelineConfig {
            layout,
            page_ttl: cache_config.instances_ttl(),
            no_cache: cache_config.no_cache,
        },
    );

    let ispublic = networks.is_public_filter();
    let (result_tx, mut result_rx) = mpsc::channel(1);

    while let Some(instance) = stream.recv().await {
        if instance.is_docker_container() {
            continue;
        }

        let image = images.get(&instance.image).await.ok();
        let has_public = networks.has_public(&instance).await;
        let mut context = Context::new(instance_context(&instance, image.as_ref(), has_public));
        context.register("ispublic", Arc::clone(&ispublic));
        if !evaluator.matches(&context).await? {
            continue;
        }

        let (job, result) = session
            .build_job(
                &instance,
                &images,
                &networks,
                auth_methods.clone(),
                command.clone(),
                stdin_path.clone(),
            )
            .await?;

        if let Some(mode) = print_mode {
            println!("{}", session.print_conf(&job, mode)?);
            continue;
        }

        session.run(job).await?;
        let forward = result_tx.clone();
        tokio::spawn(async move {
            if let Ok(result) = result.await {
                let _ = forward.send(result).await;
            }
        });
    }
    drop(result_tx);
    stream.finish().await?;

    let mut count = 0usize;
    while let Some(result) = result_rx.recv().await {
        count += 1;
        eprintln!("{}", cli::format_result_header(count, &result));
        if inline_output
            && result.status.is_ok()
            && let Some(stdout) = &result.stdout
        {
            let mut out = std::io::stdout();
            let _ = out.write_all(stdout);
            let _ = out.flush();
        }
    }

    session.close().await;
    images.close().await;
    networks.close().await;
    Ok(0)
}

fn ensure_output_directory(directory: &str) -> Result<(), CliError> {
    if directory.trim().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(directory)
        .map_err(|err| CliError::Config(format!("cannot create a directory({directory}): {err}")))
}

fn stage_stdin() -> Result<Option<(tempfile::NamedTempFile, Utf8PathBuf)>, CliError> {
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(None);
    }

    let mut file =
        tempfile::NamedTempFile::new().map_err(|err| CliError::Stdin(err.to_string()))?;
    std::io::copy(&mut stdin, file.as_file_mut())
        .map_err(|err| CliError::Stdin(err.to_string()))?;
    let path = Utf8PathBuf::from_path_buf(file.path().to_path_buf())
        .map_err(|path| CliError::Stdin(format!("temp path is not utf8: {}", path.display())))?;
    Ok(Some((file, path)))
}
