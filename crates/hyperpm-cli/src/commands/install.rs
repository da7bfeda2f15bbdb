use hyperpm_core::paths;
use hyperpm_core::pkg::{
    pkg_codes, ContentStore, InstallError, InstallEvent, InstallOptions, InstallReport, Installer,
    NodeState, PackageSpec, RegistryClient, RetryPolicy,
};
use hyperpm_core::Config;
use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Exit code for a failed install.
const EXIT_INSTALL_FAILED: i32 = 1;
/// Exit code for invalid arguments or manifest.
const EXIT_INVALID_INPUT: i32 = 2;

#[derive(Debug, Clone)]
pub struct InstallArgs {
    pub names: Vec<String>,
    pub frozen_lockfile: bool,
    pub include_dev: bool,
    pub include_optional: bool,
    pub concurrency: usize,
}

/// JSON result for `hyperpm install --json`.
#[derive(Serialize)]
struct InstallJsonResult {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    install: Option<InstallReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorInfo>,
}

#[derive(Serialize)]
struct ErrorInfo {
    code: &'static str,
    message: String,
}

pub fn run(config: &Config, args: InstallArgs) -> Result<()> {
    let json = config.json_logs;

    let specs = match parse_specs(&args.names) {
        Ok(specs) => specs,
        Err((code, message)) => fail(json, EXIT_INVALID_INPUT, code, message),
    };

    let root = match paths::require_project_root(&config.cwd) {
        Ok(root) => root,
        Err(e) => fail(json, EXIT_INVALID_INPUT, e.code(), e.to_string()),
    };

    let client = match RegistryClient::for_project(&root) {
        Ok(client) => client,
        Err(e) => fail(json, EXIT_INVALID_INPUT, e.code(), e.message().to_string()),
    };
    let store = ContentStore::for_channel(config.channel);

    let options = InstallOptions {
        concurrency: args.concurrency,
        retry: RetryPolicy::default(),
        include_dev: args.include_dev,
        include_optional: args.include_optional,
        frozen_lockfile: args.frozen_lockfile,
    };

    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    let start = Instant::now();
    let result = runtime.block_on(install(&root, &client, &store, options, &specs, json));

    match result {
        Ok(report) => {
            let ok = report.ok;
            if json {
                print_json(&InstallJsonResult {
                    ok,
                    install: Some(report),
                    error: None,
                });
            } else {
                print_summary(&report, start);
            }
            if !ok {
                std::process::exit(EXIT_INSTALL_FAILED);
            }
            Ok(())
        }
        Err(e) => {
            let exit_code = if is_input_error(&e) {
                EXIT_INVALID_INPUT
            } else {
                EXIT_INSTALL_FAILED
            };
            fail(json, exit_code, e.code(), e.to_string())
        }
    }
}

async fn install(
    root: &Path,
    client: &RegistryClient,
    store: &ContentStore,
    options: InstallOptions,
    specs: &[PackageSpec],
    json: bool,
) -> Result<InstallReport, InstallError> {
    let cancel = Arc::new(AtomicBool::new(false));
    let ctrl_c = {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, finishing in-flight packages");
                cancel.store(true, Ordering::SeqCst);
            }
        })
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(print_progress(rx, json));

    let installer = Installer::new(root, client, store, options).with_cancel_flag(cancel);
    let result = installer.install(specs, &tx).await;

    drop(tx);
    let _ = printer.await;
    ctrl_c.abort();
    result
}

/// Print one line per finished node in human mode.
async fn print_progress(mut rx: mpsc::UnboundedReceiver<InstallEvent>, json: bool) {
    while let Some(event) = rx.recv().await {
        if json {
            continue;
        }
        if let InstallEvent::NodeStateChanged { package, new, .. } = event {
            match new {
                NodeState::Done => println!("+ {package}"),
                NodeState::Failed(reason) => eprintln!("! {package}: {reason}"),
                _ => {}
            }
        }
    }
}

fn parse_specs(names: &[String]) -> Result<Vec<PackageSpec>, (&'static str, String)> {
    names
        .iter()
        .map(|name| PackageSpec::parse(name).map_err(|e| (e.code(), e.message().to_string())))
        .collect()
}

fn is_input_error(e: &InstallError) -> bool {
    matches!(
        e.code(),
        pkg_codes::PKG_PACKAGE_JSON_NOT_FOUND
            | pkg_codes::PKG_PACKAGE_JSON_INVALID
            | pkg_codes::PKG_SPEC_INVALID
    )
}

fn print_summary(report: &InstallReport, start: Instant) {
    let elapsed = start.elapsed();
    if report.ok {
        info!(
            packages = report.packages,
            store_hits = report.store_hits,
            fetches = report.fetches,
            "done"
        );
        println!(
            "\n{} packages installed ({} linked, {} up to date) in {:.2}s",
            report.packages,
            report.linked,
            report.unchanged,
            elapsed.as_secs_f64()
        );
        for (name, range) in &report.saved {
            println!("saved {name}@{range} to package.json");
        }
        if report.lockfile_written {
            println!("lockfile updated");
        }
    } else {
        eprintln!(
            "\n{} of {} packages failed{}",
            report.failed.len(),
            report.packages,
            if report.cancelled { " (cancelled)" } else { "" }
        );
        for (path, failure) in &report.failed {
            eprintln!("  {path} ({}): {} {}", failure.package, failure.code, failure.reason);
        }
        eprintln!("lockfile not written");
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(out) => println!("{out}"),
        Err(e) => eprintln!("error: failed to serialize result: {e}"),
    }
}

fn fail(json: bool, exit_code: i32, code: &'static str, message: String) -> ! {
    if json {
        print_json(&InstallJsonResult {
            ok: false,
            install: None,
            error: Some(ErrorInfo { code, message }),
        });
    } else {
        eprintln!("error: {code}: {message}");
    }
    std::process::exit(exit_code);
}
