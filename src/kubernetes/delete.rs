// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Object deletion pinned to the observed UID.

use kube::api::{Api, DeleteParams, DynamicObject, Preconditions};
use kube::ResourceExt;

use crate::error::Result;

/// Delete an object only if it still has the UID we reconciled. A namesake
/// recreated after expiry must not be deleted; the API server rejects the
/// precondition with a conflict, which the scheduler retries. NotFound is
/// treated as success since the object is already gone.
pub async fn delete_with_uid_precondition(
    api: &Api<DynamicObject>,
    obj: &DynamicObject,
) -> Result<()> {
    let params = DeleteParams {
        preconditions: Some(Preconditions {
            uid: obj.uid(),
            resource_version: None,
        }),
        ..DeleteParams::default()
    };
    match api.delete(&obj.name_any(), &params).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}
