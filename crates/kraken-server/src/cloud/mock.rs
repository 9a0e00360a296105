// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process provider used by tests and local development.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kraken_core::model::DeploymentMethod;
use serde_json::{Map, Value};

use super::{CloudError, CloudProvider, Deployment, Machine, MachineSpec, RemoteMachine};

#[derive(Debug, Clone)]
struct MockMachine {
    group_id: i64,
    created: DateTime<Utc>,
    terminated: bool,
}

#[derive(Debug, Default)]
struct MockState {
    next: u64,
    machines: BTreeMap<String, MockMachine>,
    destroyed: Vec<String>,
    specs: Vec<MachineSpec>,
}

/// Provider that keeps machines in memory.
#[derive(Debug)]
pub struct MockProvider {
    method: DeploymentMethod,
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new(method: DeploymentMethod) -> Self {
        Self {
            method,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Pretend a machine of `group_id` exists at the provider.
    pub fn insert_machine(&self, machine_id: &str, group_id: i64, created: DateTime<Utc>) {
        if let Ok(mut s) = self.state.lock() {
            s.machines.insert(
                machine_id.to_string(),
                MockMachine {
                    group_id,
                    created,
                    terminated: false,
                },
            );
        }
    }

    /// Machine ids passed to `destroy_machine`, in call order.
    pub fn destroyed(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.destroyed.clone())
            .unwrap_or_default()
    }

    /// Specs passed to `create_machines`, in call order.
    pub fn created_specs(&self) -> Vec<MachineSpec> {
        self.state
            .lock()
            .map(|s| s.specs.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MockState>, CloudError> {
        self.state
            .lock()
            .map_err(|_| CloudError::Response("mock provider poisoned".into()))
    }
}

#[async_trait]
impl CloudProvider for MockProvider {
    fn method(&self) -> DeploymentMethod {
        self.method
    }

    async fn create_machines(
        &self,
        _deployment: &Deployment,
        spec: &MachineSpec,
    ) -> Result<Vec<Machine>, CloudError> {
        let mut s = self.lock()?;
        s.specs.push(spec.clone());
        let mut out = Vec::with_capacity(spec.count);
        for _ in 0..spec.count {
            s.next += 1;
            let id = format!("mock-{}", s.next);
            s.machines.insert(
                id.clone(),
                MockMachine {
                    group_id: spec.agents_group_id,
                    created: Utc::now(),
                    terminated: false,
                },
            );
            out.push(Machine {
                machine_id: id.clone(),
                name: id.clone(),
                address: format!("10.1.0.{}", s.next),
                ip_address: None,
                extra: Map::from_iter([("mock".to_string(), Value::Bool(true))]),
            });
        }
        Ok(out)
    }

    async fn destroy_machine(
        &self,
        _deployment: &Deployment,
        machine_id: &str,
    ) -> Result<(), CloudError> {
        let mut s = self.lock()?;
        if let Some(m) = s.machines.get_mut(machine_id) {
            m.terminated = true;
        }
        s.destroyed.push(machine_id.to_string());
        Ok(())
    }

    async fn machine_exists(
        &self,
        _deployment: &Deployment,
        machine_id: &str,
    ) -> Result<bool, CloudError> {
        let s = self.lock()?;
        Ok(s.machines.get(machine_id).is_some_and(|m| !m.terminated))
    }

    async fn list_machines(
        &self,
        _deployment: &Deployment,
        agents_group_id: i64,
    ) -> Result<Vec<RemoteMachine>, CloudError> {
        let s = self.lock()?;
        Ok(s.machines
            .iter()
            .filter(|(_, m)| m.group_id == agents_group_id)
            .map(|(id, m)| RemoteMachine {
                machine_id: id.clone(),
                created: Some(m.created),
                terminated: m.terminated,
            })
            .collect())
    }
}
