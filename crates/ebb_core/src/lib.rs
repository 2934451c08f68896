/*
 * SPDX-FileCopyrightText: 2026 Ebb Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod delivery_queue;
pub mod engagement;
pub mod error;
pub mod follows;
pub mod notifications;
pub mod payload;
pub mod posts;
pub mod relay;
pub mod repair;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use delivery_queue::{DeliveryItem, DeliveryWorker, QueueSettings};
pub use error::{Result, StoreError};
pub use follows::{local_actor_ref, Follow, RemoteAccount, RemoteActorProfile};
pub use notifications::Notification;
pub use posts::{local_uri, Account, LocalPost, Post, RemotePost};
pub use relay::{RelayStatus, RelaySubscription};
pub use store::{EngineConfig, RetryPolicy, Store};
