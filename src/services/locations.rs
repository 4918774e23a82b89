//! Navigation and location-list service.

use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_lsp::lsp_types::{Location, Position, Range, Url};

use crate::core::{ConfigurationStore, DocumentModel};
use crate::host::{decode, Env, HostConnection};
use crate::util::{read, write};

/// Collaborators the location service reads from
#[derive(Clone)]
pub struct LocationContext {
    pub documents: Arc<DocumentModel>,
    pub configurations: Arc<ConfigurationStore>,
}

#[derive(Debug, Deserialize)]
struct CursorReply {
    uri: Url,
    line: u32,
    character: u32,
}

pub struct LocationService {
    context: LocationContext,
    host: RwLock<Option<Arc<dyn HostConnection>>>,
}

impl LocationService {
    pub const JUMP_TO: &'static str = "jump_to";
    pub const CURSOR_POSITION: &'static str = "cursor_position";
    pub const SET_LOCATION_LIST: &'static str = "set_location_list";

    pub fn new(context: LocationContext) -> Self {
        Self {
            context,
            host: RwLock::new(None),
        }
    }

    pub async fn attach(&self, host: Arc<dyn HostConnection>, _env: &Env) -> Result<()> {
        *write(&self.host) = Some(host);
        Ok(())
    }

    /// Move the cursor to `uri`, opening it with `open_command` (or the
    /// configured `workspace.jumpCommand`) when it is not the current buffer.
    pub async fn jump_to(
        &self,
        uri: &Url,
        position: Option<Position>,
        open_command: Option<&str>,
    ) -> Result<()> {
        let command = match open_command {
            Some(command) => command.to_string(),
            None => self
                .context
                .configurations
                .get_or("workspace.jumpCommand", "edit".to_string()),
        };
        let position = position.unwrap_or_default();
        self.host()?
            .call(
                Self::JUMP_TO,
                vec![
                    json!(uri),
                    json!(position.line),
                    json!(position.character),
                    json!(command),
                ],
            )
            .await
            .with_context(|| format!("Failed to jump to {}", uri))?;
        Ok(())
    }

    pub async fn current_location(&self) -> Result<Location> {
        let reply = self
            .host()?
            .call(Self::CURSOR_POSITION, Vec::new())
            .await?;
        let cursor: CursorReply = decode(Self::CURSOR_POSITION, reply)?;
        let position = Position::new(cursor.line, cursor.character);
        Ok(Location::new(cursor.uri, Range::new(position, position)))
    }

    /// Fill the host's location list, one entry per location with its line
    /// text.
    pub async fn show_locations(&self, title: &str, locations: &[Location]) -> Result<()> {
        let mut items: Vec<Value> = Vec::with_capacity(locations.len());
        for location in locations {
            let start = location.range.start;
            let text = self.get_line(&location.uri, start.line).await.unwrap_or_default();
            items.push(json!({
                "uri": location.uri,
                "lnum": start.line + 1,
                "col": start.character + 1,
                "text": text.trim(),
            }));
        }
        self.host()?
            .call(Self::SET_LOCATION_LIST, vec![json!(title), Value::Array(items)])
            .await?;
        Ok(())
    }

    /// Text of `line` in `uri`: from the open document when loaded,
    /// otherwise from disk.
    pub async fn get_line(&self, uri: &Url, line: u32) -> Result<String> {
        if let Some(doc) = self.context.documents.get_by_uri(uri) {
            return Ok(doc.line(line as usize).unwrap_or_default().to_string());
        }
        let path = uri
            .to_file_path()
            .map_err(|_| anyhow!("{} is neither loaded nor a file", uri))?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(content.lines().nth(line as usize).unwrap_or_default().to_string())
    }

    fn host(&self) -> Result<Arc<dyn HostConnection>> {
        read(&self.host)
            .clone()
            .ok_or_else(|| anyhow!("location service is not attached"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BufferInfo, DocumentContext, WorkspaceFolderRegistry};
    use crate::host::MemoryHost;

    async fn service(host: Arc<MemoryHost>) -> (LocationService, Arc<DocumentModel>) {
        host.reply(DocumentModel::LIST_BUFFERS, json!([]));
        let configurations = Arc::new(ConfigurationStore::new());
        let documents = Arc::new(DocumentModel::new(DocumentContext {
            configurations: configurations.clone(),
            folders: Arc::new(WorkspaceFolderRegistry::new()),
        }));
        documents.attach(host.clone(), &Env::default()).await.unwrap();
        let service = LocationService::new(LocationContext {
            documents: documents.clone(),
            configurations,
        });
        service.attach(host, &Env::default()).await.unwrap();
        (service, documents)
    }

    #[tokio::test]
    async fn test_jump_uses_configured_command() {
        let host = Arc::new(MemoryHost::new());
        let (service, _) = service(host.clone()).await;
        let uri = Url::parse("file:///tmp/a.rs").unwrap();

        service.jump_to(&uri, Some(Position::new(3, 4)), None).await.unwrap();
        service.jump_to(&uri, None, Some("vsplit")).await.unwrap();

        let calls = host.calls_to(LocationService::JUMP_TO);
        assert_eq!(calls[0], vec![json!(uri), json!(3), json!(4), json!("edit")]);
        assert_eq!(calls[1][3], json!("vsplit"));
    }

    #[tokio::test]
    async fn test_lines_come_from_documents_then_disk() {
        let host = Arc::new(MemoryHost::new());
        let (service, documents) = service(host.clone()).await;
        let open = Url::parse("untitled:scratch").unwrap();
        documents.handle_open(BufferInfo {
            bufnr: 1,
            uri: open.clone(),
            language_id: "text".to_string(),
            version: 1,
            text: "first\nsecond".to_string(),
        });

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, "zero\none\n").unwrap();
        let on_disk = Url::from_file_path(&file).unwrap();

        assert_eq!(service.get_line(&open, 1).await.unwrap(), "second");
        assert_eq!(service.get_line(&on_disk, 1).await.unwrap(), "one");

        service
            .show_locations(
                "refs",
                &[Location::new(on_disk.clone(), Range::new(Position::new(0, 2), Position::new(0, 4)))],
            )
            .await
            .unwrap();
        let items = &host.calls_to(LocationService::SET_LOCATION_LIST)[0][1];
        assert_eq!(items[0]["lnum"], json!(1));
        assert_eq!(items[0]["col"], json!(3));
        assert_eq!(items[0]["text"], json!("zero"));
    }

    #[tokio::test]
    async fn test_current_location_decodes_cursor() {
        let host = Arc::new(MemoryHost::new());
        host.reply(
            LocationService::CURSOR_POSITION,
            json!({"uri": "file:///tmp/x.rs", "line": 9, "character": 2}),
        );
        let (service, _) = service(host).await;

        let location = service.current_location().await.unwrap();
        assert_eq!(location.range.start, Position::new(9, 2));
        assert_eq!(location.uri.path(), "/tmp/x.rs");
    }
}
