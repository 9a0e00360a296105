// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fetching schema code from a git repository.
//!
//! The repository is shallow-cloned into a temporary directory. A git bundle
//! of the previous checkout is kept in the branch's `-git` bucket; when it is
//! present the clone starts from the bundle and only fetches the new head.

use std::path::{Component, Path};

use kraken_protocol::messages::SECRET_MASK;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};
use url::Url;

use super::SchemaError;
use crate::objstore::{Bucket, ObjectStore};
use crate::process;

/// Where a stage's schema lives.
#[derive(Debug, Clone)]
pub struct RepoSource<'a> {
    pub url: &'a str,
    pub branch: &'a str,
    pub access_token: Option<&'a str>,
    pub schema_file: &'a str,
}

/// Schema code read from a repository checkout.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoSchema {
    pub code: String,
    /// Commit SHA of the checkout.
    pub version: String,
}

/// Object key of the cached bundle of `url`.
pub fn bundle_key(url: &str) -> String {
    format!("{}/repo.bundle", hex::encode(Sha1::digest(url.as_bytes())))
}

/// Put the access token into an https URL. Other URLs are returned unchanged.
pub fn authenticated_url(url: &str, token: Option<&str>) -> String {
    let Some(token) = token.filter(|t| !t.is_empty()) else {
        return url.to_string();
    };
    match Url::parse(url) {
        Ok(mut parsed) if parsed.scheme() == "https" => {
            if parsed.set_username(token).is_err() {
                return url.to_string();
            }
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}

fn check_schema_file(schema_file: &str) -> Result<(), SchemaError> {
    let path = Path::new(schema_file);
    let valid = !schema_file.is_empty()
        && path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if valid {
        Ok(())
    } else {
        Err(SchemaError::Repo(format!("invalid schema file path '{}'", schema_file)))
    }
}

/// Runs git, hiding the token in any error text.
async fn git(
    args: Vec<String>,
    cwd: Option<&Path>,
    token: Option<&str>,
) -> Result<String, SchemaError> {
    process::run("git", &args, cwd, None).await.map_err(|e| {
        let mut msg = e.to_string();
        if let Some(t) = token.filter(|t| !t.is_empty()) {
            msg = msg.replace(t, SECRET_MASK);
        }
        SchemaError::Repo(msg)
    })
}

/// Clone the repository and read the schema file.
pub async fn fetch_schema(
    objstore: &ObjectStore,
    branch_id: i64,
    source: &RepoSource<'_>,
) -> Result<RepoSchema, SchemaError> {
    check_schema_file(source.schema_file)?;
    let tmp = tempfile::tempdir().map_err(|e| SchemaError::Repo(e.to_string()))?;
    let checkout = tmp.path().join("repo");
    let bundle = tmp.path().join("repo.bundle");
    let remote = authenticated_url(source.url, source.access_token);
    let token = source.access_token;
    let key = bundle_key(source.url);
    let bucket = Bucket::Git(branch_id);

    let cached = objstore
        .get(bucket, &key)
        .await
        .map_err(|e| SchemaError::Repo(e.to_string()))?;
    let mut from_bundle = false;
    if let Some(data) = cached {
        tokio::fs::write(&bundle, &data)
            .await
            .map_err(|e| SchemaError::Repo(e.to_string()))?;
        match update_from_bundle(&bundle, &checkout, &remote, source.branch, token).await {
            Ok(()) => from_bundle = true,
            Err(e) => {
                warn!(url = %source.url, error = %e, "Cached git bundle unusable, cloning afresh");
                let _ = tokio::fs::remove_dir_all(&checkout).await;
            }
        }
    }
    if !from_bundle {
        git(
            vec![
                "clone".into(),
                "--depth".into(),
                "1".into(),
                "--single-branch".into(),
                "--branch".into(),
                source.branch.to_string(),
                remote.clone(),
                checkout.to_string_lossy().into_owned(),
            ],
            None,
            token,
        )
        .await?;
    }

    let version = git(vec!["rev-parse".into(), "HEAD".into()], Some(&checkout), token)
        .await?
        .trim()
        .to_string();
    let code = tokio::fs::read_to_string(checkout.join(source.schema_file))
        .await
        .map_err(|e| {
            SchemaError::Repo(format!("cannot read '{}': {}", source.schema_file, e))
        })?;

    refresh_bundle(objstore, bucket, &key, &checkout, &bundle, token).await;
    debug!(url = %source.url, version = %version, from_bundle, "Schema fetched from repository");
    Ok(RepoSchema { code, version })
}

async fn update_from_bundle(
    bundle: &Path,
    checkout: &Path,
    remote: &str,
    branch: &str,
    token: Option<&str>,
) -> Result<(), SchemaError> {
    git(
        vec![
            "clone".into(),
            bundle.to_string_lossy().into_owned(),
            checkout.to_string_lossy().into_owned(),
        ],
        None,
        token,
    )
    .await?;
    git(
        vec![
            "fetch".into(),
            "--depth".into(),
            "1".into(),
            remote.to_string(),
            branch.to_string(),
        ],
        Some(checkout),
        token,
    )
    .await?;
    git(
        vec!["checkout".into(), "-q".into(), "FETCH_HEAD".into()],
        Some(checkout),
        token,
    )
    .await?;
    Ok(())
}

/// Store a bundle of the checkout for the next refresh. Failures only cost
/// the next refresh a full clone.
async fn refresh_bundle(
    objstore: &ObjectStore,
    bucket: Bucket,
    key: &str,
    checkout: &Path,
    bundle: &Path,
    token: Option<&str>,
) {
    let created = git(
        vec![
            "bundle".into(),
            "create".into(),
            bundle.to_string_lossy().into_owned(),
            "HEAD".into(),
        ],
        Some(checkout),
        token,
    )
    .await;
    if let Err(e) = created {
        warn!(error = %e, "Cannot create git bundle");
        return;
    }
    match tokio::fs::read(bundle).await {
        Ok(data) => {
            if let Err(e) = objstore.put(bucket, key, &data).await {
                warn!(error = %e, "Cannot store git bundle");
            }
        }
        Err(e) => warn!(error = %e, "Cannot read git bundle"),
    }
}
