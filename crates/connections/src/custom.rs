// Copyright (C) 2026 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Per-session and per-connection extension state. Collaborators hang whatever they need off a
//! session or connection (an in-flight upload, a message backlog) under a string key; the
//! registry stores it opaquely and disposes of it when the owner goes away.

use ahash::AHasher;
use std::any::Any;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tether_common::RegistryError;
use tracing::error;

/// Lets a stored `Arc<dyn CustomObject>` be turned back into its concrete type. Implemented for
/// everything; never implement it by hand.
pub trait IntoAny: Any + Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> IntoAny for T {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub trait CustomObject: IntoAny {
    /// Release whatever the object holds. Called once, outside the registry lock, when its
    /// session or connection is torn down.
    fn dispose(&self) {}
}

pub(crate) type CustomObjects = HashMap<String, Arc<dyn CustomObject>, BuildHasherDefault<AHasher>>;

pub(crate) fn downcast<T: CustomObject>(
    key: &str,
    object: Arc<dyn CustomObject>,
) -> Result<Arc<T>, RegistryError> {
    object
        .into_any()
        .downcast::<T>()
        .map_err(|_| RegistryError::CustomObjectTypeMismatch {
            key: key.to_string(),
        })
}

pub(crate) fn dispose_all(objects: Vec<(String, Arc<dyn CustomObject>)>) {
    for (key, object) in objects {
        if catch_unwind(AssertUnwindSafe(|| object.dispose())).is_err() {
            error!(key, "Custom object disposal panicked");
        }
    }
}
