#![forbid(unsafe_code)]

//! Plugin hook dispatch.
//!
//! The catalog stores an ordered list of module identifiers. Each identifier
//! resolves to an executable; on dispatch it receives the event name as its
//! argument and a JSON payload on stdin. Dispatch is best-effort: a missing
//! or failing hook is logged and never affects the surrounding operation.

use std::io::Write;
use std::process::{Command, Stdio};

use serde::Serialize;

use crate::catalog::{Catalog, CatalogRead};

/// Typed payloads, one per hook point.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum HookEvent {
    SourceRegistered {
        kind: String,
        key: String,
    },
    ListSynced {
        source: String,
        new_members: usize,
        tombstoned: usize,
    },
    ItemSynced {
        iid: String,
        title: String,
    },
    ItemDownloaded {
        iid: String,
        path: String,
    },
    BatchFinished {
        operation: String,
        done: usize,
        errors: usize,
    },
}

impl HookEvent {
    fn name(&self) -> &'static str {
        match self {
            HookEvent::SourceRegistered { .. } => "source-registered",
            HookEvent::ListSynced { .. } => "list-synced",
            HookEvent::ItemSynced { .. } => "item-synced",
            HookEvent::ItemDownloaded { .. } => "item-downloaded",
            HookEvent::BatchFinished { .. } => "batch-finished",
        }
    }
}

/// Runs every registered hook for `event`, in registration order.
pub fn dispatch(catalog: &Catalog, event: &HookEvent) {
    let modules = match catalog.hooks_list() {
        Ok(modules) => modules,
        Err(err) => {
            tracing::warn!(error = %err, "could not load hook registry");
            return;
        }
    };
    if modules.is_empty() {
        return;
    }

    let payload = match serde_json::to_vec(event) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error = %err, "could not serialize hook payload");
            return;
        }
    };

    for module in modules {
        if let Err(err) = run_hook(&module, event.name(), &payload) {
            tracing::warn!(module = %module, event = event.name(), error = %err, "hook failed");
        }
    }
}

fn run_hook(module: &str, event_name: &str, payload: &[u8]) -> std::io::Result<()> {
    let mut child = Command::new(module)
        .arg(event_name)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    if let Some(stdin) = child.stdin.as_mut() {
        stdin.write_all(payload)?;
    }
    let status = child.wait()?;
    if !status.success() {
        return Err(std::io::Error::other(format!("hook exited with {status}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::open_temp;
    use std::fs;

    #[test]
    fn dispatch_feeds_payload_to_registered_hooks() {
        let (dir, mut cat) = open_temp();
        let out_file = dir.path().join("seen");
        let hook_path = dir.path().join("hook.sh");
        fs::write(
            &hook_path,
            format!("#!/usr/bin/env bash\necho \"$1 $(cat)\" > {}\n", out_file.display()),
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&hook_path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&hook_path, perms).unwrap();
        }

        let tx = cat.txn().unwrap();
        tx.hook_add(hook_path.to_str().unwrap()).unwrap();
        tx.commit().unwrap();

        dispatch(
            &cat,
            &HookEvent::ItemDownloaded {
                iid: "aaaaaaaaaaa".into(),
                path: "/arc/MIT/a/x.mkv".into(),
            },
        );

        let seen = fs::read_to_string(&out_file).unwrap();
        assert!(seen.starts_with("item-downloaded "));
        assert!(seen.contains("\"iid\":\"aaaaaaaaaaa\""));
    }

    #[test]
    fn dispatch_survives_missing_hook_executable() {
        let (_d, mut cat) = open_temp();
        let tx = cat.txn().unwrap();
        tx.hook_add("/nonexistent/hook-binary").unwrap();
        tx.commit().unwrap();
        // Must not panic or error out.
        dispatch(
            &cat,
            &HookEvent::BatchFinished {
                operation: "download".into(),
                done: 0,
                errors: 1,
            },
        );
    }
}
