// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Secret masking for tool output.

use std::borrow::Cow;
use std::sync::Arc;

use kraken_protocol::messages::SECRET_MASK;

/// Replaces every occurrence of a job secret with [`SECRET_MASK`].
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    secrets: Arc<Vec<String>>,
}

impl SecretMasker {
    /// Empty values are dropped; longer secrets are replaced first so a
    /// secret containing another one is masked whole.
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .collect();
        secrets.sort_by(|a, b| b.len().cmp(&a.len()));
        secrets.dedup();
        Self {
            secrets: Arc::new(secrets),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn mask<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut out = Cow::Borrowed(text);
        for secret in self.secrets.iter() {
            if out.contains(secret.as_str()) {
                out = Cow::Owned(out.replace(secret.as_str(), SECRET_MASK));
            }
        }
        out
    }
}
