//! Keymap registry.
//!
//! The host owns key-sequence parsing; this registry only remembers which
//! handler belongs to which (mode, key) and tells the host to map it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{BoxFuture, NotifyQueue};
use crate::event::Disposable;
use crate::host::{Env, HostConnection};
use crate::util::{read, write};

type KeymapHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapMode {
    #[serde(rename = "n")]
    Normal,
    #[serde(rename = "i")]
    Insert,
    #[serde(rename = "x")]
    Visual,
    #[serde(rename = "s")]
    Select,
    #[serde(rename = "o")]
    Operator,
    #[serde(rename = "c")]
    Command,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeymapOptions {
    pub sync: bool,
    pub silent: bool,
    pub repeat: bool,
}

struct Keymap {
    options: KeymapOptions,
    handler: KeymapHandler,
}

#[derive(Default)]
pub struct KeymapRegistry {
    keymaps: RwLock<HashMap<(MapMode, String), Keymap>>,
    host: RwLock<Option<Arc<dyn HostConnection>>>,
    notifications: NotifyQueue,
}

impl KeymapRegistry {
    pub const SET_KEYMAP: &'static str = "set_keymap";
    pub const DEL_KEYMAP: &'static str = "del_keymap";

    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, host: Arc<dyn HostConnection>, _env: &Env) -> Result<()> {
        *write(&self.host) = Some(host.clone());
        self.notifications.flush().await;
        let mut definitions: Vec<Vec<Value>> = read(&self.keymaps)
            .iter()
            .map(|((mode, key), keymap)| set_args(*mode, key, &keymap.options))
            .collect();
        definitions.sort_by_key(|args| args[1].to_string());
        for args in definitions {
            host.notify(Self::SET_KEYMAP, args).await?;
        }
        Ok(())
    }

    /// Map `key` in `mode` to `handler`. Each (mode, key) pair has one owner.
    pub fn register<F, Fut>(
        self: &Arc<Self>,
        mode: MapMode,
        key: &str,
        options: KeymapOptions,
        handler: F,
    ) -> Result<Disposable>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let slot = (mode, key.to_string());
        {
            let mut keymaps = write(&self.keymaps);
            if keymaps.contains_key(&slot) {
                bail!("Keymap {:?} {} already registered", mode, key);
            }
            let handler: KeymapHandler =
                Arc::new(move || -> BoxFuture<'static, Result<Value>> { Box::pin(handler()) });
            keymaps.insert(
                slot.clone(),
                Keymap {
                    options: options.clone(),
                    handler,
                },
            );
        }
        if let Some(host) = read(&self.host).clone() {
            self.notifications
                .push(host, Self::SET_KEYMAP, set_args(mode, key, &options));
        }

        let this = Arc::downgrade(self);
        Ok(Disposable::from_fn(move || {
            let Some(this) = this.upgrade() else {
                return;
            };
            let removed = write(&this.keymaps).remove(&slot).is_some();
            if removed && let Some(host) = read(&this.host).clone() {
                this.notifications
                    .push(host, Self::DEL_KEYMAP, vec![json!(slot.0), json!(slot.1)]);
            }
        }))
    }

    pub fn has_keymap(&self, mode: MapMode, key: &str) -> bool {
        read(&self.keymaps).contains_key(&(mode, key.to_string()))
    }

    /// Run the handler the host invoked.
    pub async fn dispatch(&self, mode: MapMode, key: &str) -> Result<Value> {
        let handler = read(&self.keymaps)
            .get(&(mode, key.to_string()))
            .map(|k| k.handler.clone())
            .ok_or_else(|| anyhow!("No keymap for {:?} {}", mode, key))?;
        handler().await
    }

    pub fn dispose(&self) {
        write(&self.keymaps).clear();
        *write(&self.host) = None;
    }
}

fn set_args(mode: MapMode, key: &str, options: &KeymapOptions) -> Vec<Value> {
    vec![json!(mode), json!(key), json!(options)]
}
