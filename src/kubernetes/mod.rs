// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes utilities: GVK resolution, cache trimming, event admission, deletes.

pub mod cache;
pub mod client;
pub mod delete;
pub mod predicate;

pub use client::{probe_list, resolve_gvk, WatchedResource};
pub use delete::delete_with_uid_precondition;
