/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod component_pointer;
pub mod delivery_scheduler;
pub mod http_retry;
pub mod keys;
pub mod net_metrics;
pub mod onion_assets;
pub mod onion_install;
pub mod onion_process;
pub mod onion_updates;
pub mod outbox_store;
pub mod pin_store;
pub mod pinned_hashes;
pub mod proxy;
pub mod retry_policy;
pub mod route_policy;
pub mod runtime;
pub mod sync_crypto;
pub mod sync_engine;
pub mod sync_store;
pub mod transport_supervisor;
pub mod ui_events;
pub mod vault_keyring;
