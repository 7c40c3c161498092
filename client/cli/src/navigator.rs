//! Command dispatch
//!
//! [`Navigator::handle`] turns one inbound event into replies on an
//! [`Outbox`]. Transports run one call per event, concurrently. Per-user
//! state is only touched under that user's session lock, and the lock is
//! never held while waiting on the network: a handler reads what it needs,
//! releases, talks to the server, then reacquires to apply the result.

use crate::api::{AlistClient, Listing, SearchScope};
use crate::cache::ResponseCache;
use crate::commands::{self, as_index, Command};
use crate::config::{ConfigResolver, EffectiveConfig, Settings};
use crate::error::{NavError, NavResult};
use crate::format;
use crate::reply::Outbox;
use crate::session::{resolve_path, SessionRegistry, SharedSession};
use crate::store::JsonStore;
use crate::transfer::{Attachment, TransferOrchestrator, UploadRequest};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Alist treats `per_page = 0` as "no paging".
const LIST_ALL: u32 = 0;
const SEARCH_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct Inbound {
    pub user_id: String,
    pub user_name: String,
    pub kind: InboundKind,
}

#[derive(Debug, Clone)]
pub enum InboundKind {
    Command(String),
    Attachment(Attachment),
}

impl Inbound {
    pub fn command(user_id: &str, text: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            user_name: user_id.to_string(),
            kind: InboundKind::Command(text.to_string()),
        }
    }

    pub fn attachment(user_id: &str, attachment: Attachment) -> Self {
        Self {
            user_id: user_id.to_string(),
            user_name: user_id.to_string(),
            kind: InboundKind::Attachment(attachment),
        }
    }
}

pub struct Navigator {
    settings: Arc<Settings>,
    resolver: ConfigResolver,
    cache: ResponseCache,
    sessions: Arc<SessionRegistry>,
    transfers: TransferOrchestrator,
    http: reqwest::Client,
}

impl Navigator {
    pub fn new(settings: Settings) -> Self {
        let settings = Arc::new(settings);
        let store = JsonStore::new(settings.data_dir());
        tracing::info!("data directory: {}", store.root().display());

        Self {
            resolver: ConfigResolver::new(Arc::clone(&settings), store.clone()),
            cache: ResponseCache::new(store),
            sessions: Arc::new(SessionRegistry::new(settings.session_capacity)),
            transfers: TransferOrchestrator::new(&settings),
            http: reqwest::Client::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Handle one event. Failures become a single text reply.
    pub async fn handle(&self, event: Inbound, outbox: &Outbox) {
        let Inbound {
            user_id,
            user_name,
            kind,
        } = event;

        let result = match kind {
            InboundKind::Command(text) => match commands::parse(&text) {
                Ok(command) => {
                    tracing::debug!("{}: {}", user_id, command.name());
                    self.dispatch(&user_id, &user_name, command, outbox).await
                }
                Err(e) => Err(e),
            },
            InboundKind::Attachment(attachment) => {
                self.on_attachment(&user_id, attachment, outbox).await
            }
        };

        if let Err(e) = result {
            tracing::warn!("{}: {}", user_id, e);
            outbox.text(e.to_string()).await;
        }
    }

    async fn dispatch(
        &self,
        user_id: &str,
        user_name: &str,
        command: Command,
        outbox: &Outbox,
    ) -> NavResult<()> {
        match command {
            Command::ConfigShow => {
                let cfg = self.resolver.resolve(user_id);
                outbox
                    .text(format::format_config(
                        user_name,
                        &cfg,
                        self.settings.require_user_auth,
                        &self.settings.default_alist_url,
                    ))
                    .await;
            }
            Command::ConfigSetup => outbox.text(format::setup_text()).await,
            Command::ConfigSet { key, value } => {
                self.config_set(user_id, user_name, &key, &value, outbox).await?
            }
            Command::ConfigTest => self.config_test(user_id, outbox).await?,
            Command::ClearCache => {
                let removed = self.cache.clear(Some(user_id));
                tracing::info!("cleared {} cached listings for {}", removed, user_id);
                outbox
                    .text(format!("cleared {} cached listings", removed))
                    .await;
            }
            Command::List(arg) => self.list(user_id, arg.as_deref(), outbox).await?,
            Command::Search { keyword, path } => {
                self.search(user_id, &keyword, path.as_deref(), outbox).await?
            }
            Command::Info(path) => self.info(user_id, &path, outbox).await?,
            Command::Download(arg) => self.download(user_id, &arg, outbox).await?,
            Command::Quit => self.go_back(user_id, outbox).await?,
            Command::Upload => self.start_upload(user_id, outbox).await?,
            Command::UploadCancel => {
                let session = self.sessions.session(user_id);
                let cancelled = session.lock().await.upload.cancel();
                let text = if cancelled {
                    "upload mode off"
                } else {
                    "not in upload mode"
                };
                outbox.text(text).await;
            }
            Command::Help => {
                let configured = self.resolver.is_configured(user_id);
                outbox
                    .text(format::help_text(self.settings.require_user_auth, configured))
                    .await;
            }
        }
        Ok(())
    }

    fn client(&self, cfg: &EffectiveConfig) -> NavResult<AlistClient> {
        cfg.require_server()?;
        Ok(AlistClient::from_config(self.http.clone(), cfg)
            .timeout(Duration::from_secs(self.settings.request_timeout_secs)))
    }

    async fn current_path(&self, session: &SharedSession) -> String {
        session.lock().await.nav.current_path().to_string()
    }

    /// Listing for `path`, served from the cache when allowed and fresh.
    async fn fetch_listing(
        &self,
        client: &AlistClient,
        user_id: &str,
        path: &str,
    ) -> NavResult<(Listing, bool)> {
        let server = client.base_url();
        if self.settings.enable_cache {
            if let Some(listing) =
                self.cache
                    .get(server, path, user_id, self.settings.cache_duration)
            {
                return Ok((listing, true));
            }
        }

        let listing = client
            .list_directory(path, 1, LIST_ALL)
            .await
            .ok_or_else(|| NavError::ConnectionFailure(format!("cannot access {}", path)))?;

        if self.settings.enable_cache {
            self.cache.set(server, path, user_id, &listing);
        }
        Ok((listing, false))
    }

    async fn config_set(
        &self,
        user_id: &str,
        user_name: &str,
        key: &str,
        value: &str,
        outbox: &Outbox,
    ) -> NavResult<()> {
        if !self.settings.require_user_auth {
            return Err(NavError::BadArgument(
                "per-user settings are disabled, the administrator's server is used".to_string(),
            ));
        }
        self.resolver.set_user_value(user_id, key, value)?;
        tracing::info!("{} changed {}", user_id, key);

        let shown = if matches!(key, "password" | "token") {
            "***"
        } else {
            value
        };
        outbox
            .text(format!("set {} = {} for {}", key, shown, user_name))
            .await;
        Ok(())
    }

    async fn config_test(&self, user_id: &str, outbox: &Outbox) -> NavResult<()> {
        let cfg = self.resolver.resolve(user_id);
        let client = self.client(&cfg)?;
        match client.list_directory("/", 1, 1).await {
            Some(_) => {
                outbox
                    .text(format!("connected to {}", client.base_url()))
                    .await;
                Ok(())
            }
            None => Err(NavError::ConnectionFailure(format!(
                "{} did not answer, check the settings",
                client.base_url()
            ))),
        }
    }

    async fn list(&self, user_id: &str, arg: Option<&str>, outbox: &Outbox) -> NavResult<()> {
        let cfg = self.resolver.resolve(user_id);
        let client = self.client(&cfg)?;
        let session = self.sessions.session(user_id);

        let target = if let Some(n) = arg.and_then(as_index) {
            let (entry, path) = {
                let state = session.lock().await;
                let entry = state
                    .nav
                    .resolve_index(n)
                    .cloned()
                    .ok_or(NavError::InvalidIndex(n))?;
                let path = state.nav.child_path(&entry.name);
                (entry, path)
            };
            if !entry.is_dir {
                outbox
                    .text(format!("preparing download: {}", entry.name))
                    .await;
                self.transfers
                    .download(&client, user_id, &path, &entry, outbox)
                    .await?;
                return Ok(());
            }
            path
        } else if let Some(arg) = arg {
            resolve_path(&self.current_path(&session).await, arg)
        } else {
            self.current_path(&session).await
        };

        let (listing, from_cache) = match self.fetch_listing(&client, user_id, &target).await {
            Ok(found) => found,
            Err(e) => {
                return Err(match client.stat(&target).await {
                    Some(entry) if !entry.is_dir => NavError::NotADirectory(target),
                    _ => e,
                })
            }
        };

        let text = {
            let mut state = session.lock().await;
            state
                .nav
                .show(&target, listing.content.clone(), cfg.max_display_entries);
            format::format_listing(
                state.nav.current_path(),
                &listing.content,
                state.nav.items(),
                state.nav.ancestors().len(),
                from_cache,
            )
        };
        outbox.text(text).await;
        Ok(())
    }

    async fn go_back(&self, user_id: &str, outbox: &Outbox) -> NavResult<()> {
        let cfg = self.resolver.resolve(user_id);
        let client = self.client(&cfg)?;
        let session = self.sessions.session(user_id);

        let back = session.lock().await.nav.peek_back().map(str::to_string);
        let Some(target) = back else {
            outbox.text("already at the root, nothing to go back to").await;
            return Ok(());
        };

        // Only pop once the parent is reachable, so a failed listing keeps
        // the history intact.
        let (listing, from_cache) = self.fetch_listing(&client, user_id, &target).await?;

        let text = {
            let mut state = session.lock().await;
            if state.nav.peek_back() == Some(target.as_str()) {
                state.nav.go_back();
            }
            state
                .nav
                .restore(&target, listing.content.clone(), cfg.max_display_entries);
            format::format_listing(
                state.nav.current_path(),
                &listing.content,
                state.nav.items(),
                state.nav.ancestors().len(),
                from_cache,
            )
        };
        outbox.text(format!("back to {}\n\n{}", target, text)).await;
        Ok(())
    }

    async fn search(
        &self,
        user_id: &str,
        keyword: &str,
        path: Option<&str>,
        outbox: &Outbox,
    ) -> NavResult<()> {
        let cfg = self.resolver.resolve(user_id);
        let client = self.client(&cfg)?;
        let parent = match path {
            Some(path) => {
                let session = self.sessions.session(user_id);
                resolve_path(&self.current_path(&session).await, path)
            }
            None => "/".to_string(),
        };

        let results = client
            .search(keyword, &parent, SearchScope::All, 1, SEARCH_PAGE_SIZE)
            .await
            .ok_or_else(|| NavError::ConnectionFailure(format!("search in {} failed", parent)))?;

        outbox
            .text(format::format_search(
                keyword,
                &parent,
                &results.content,
                cfg.max_display_entries,
            ))
            .await;
        Ok(())
    }

    async fn info(&self, user_id: &str, path: &str, outbox: &Outbox) -> NavResult<()> {
        let cfg = self.resolver.resolve(user_id);
        let client = self.client(&cfg)?;
        let session = self.sessions.session(user_id);
        let path = resolve_path(&self.current_path(&session).await, path);

        let entry = client
            .stat(&path)
            .await
            .ok_or_else(|| NavError::BadArgument(format!("not found: {}", path)))?;
        let link = if entry.is_dir {
            None
        } else {
            client.download_locator(&path).await
        };

        outbox
            .text(format::format_info(&path, &entry, link.as_deref()))
            .await;
        Ok(())
    }

    /// `download <n>` transfers the file, `download <path>` only links it.
    async fn download(&self, user_id: &str, arg: &str, outbox: &Outbox) -> NavResult<()> {
        let cfg = self.resolver.resolve(user_id);
        let client = self.client(&cfg)?;
        let session = self.sessions.session(user_id);

        if let Some(n) = as_index(arg) {
            let (entry, path) = {
                let state = session.lock().await;
                let entry = state
                    .nav
                    .resolve_index(n)
                    .cloned()
                    .ok_or(NavError::InvalidIndex(n))?;
                let path = state.nav.child_path(&entry.name);
                (entry, path)
            };
            if entry.is_dir {
                return Err(NavError::NotAFile(entry.name));
            }
            outbox
                .text(format!("preparing download: {}", entry.name))
                .await;
            self.transfers
                .download(&client, user_id, &path, &entry, outbox)
                .await?;
            return Ok(());
        }

        let path = resolve_path(&self.current_path(&session).await, arg);
        let entry = client
            .stat(&path)
            .await
            .ok_or_else(|| NavError::BadArgument(format!("not found: {}", path)))?;
        if entry.is_dir {
            return Err(NavError::NotAFile(path));
        }
        let link = client
            .download_locator(&path)
            .await
            .ok_or_else(|| NavError::TransferError(format!("no download link for {}", path)))?;

        outbox.text(format::format_link(&entry, &link)).await;
        Ok(())
    }

    async fn start_upload(&self, user_id: &str, outbox: &Outbox) -> NavResult<()> {
        let cfg = self.resolver.resolve(user_id);
        cfg.require_server()?;

        let session = self.sessions.session(user_id);
        let (target, generation) = {
            let mut state = session.lock().await;
            let target = state.nav.current_path().to_string();
            let generation = state.upload.start(&target);
            (target, generation)
        };
        self.schedule_upload_timeout(user_id.to_string(), generation);

        tracing::info!("{} waiting for an upload to {}", user_id, target);
        outbox
            .text(format::upload_started(
                &target,
                self.settings.upload_timeout_secs,
            ))
            .await;
        Ok(())
    }

    /// The task keeps only the user id and generation; whatever session is
    /// live when it fires decides whether there is anything to end.
    fn schedule_upload_timeout(&self, user_id: String, generation: u64) {
        let sessions = Arc::clone(&self.sessions);
        let timeout = Duration::from_secs(self.settings.upload_timeout_secs);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(session) = sessions.get(&user_id) else {
                return;
            };
            if session.lock().await.upload.expire(generation) {
                tracing::info!("upload mode for {} timed out", user_id);
            }
        });
    }

    async fn on_attachment(
        &self,
        user_id: &str,
        attachment: Attachment,
        outbox: &Outbox,
    ) -> NavResult<()> {
        let Some(session) = self.sessions.get(user_id) else {
            tracing::debug!("ignoring attachment from {}: no session", user_id);
            return Ok(());
        };
        let Some(target) = session.lock().await.upload.take() else {
            tracing::debug!("ignoring attachment from {}: not waiting", user_id);
            return Ok(());
        };

        let cfg = self.resolver.resolve(user_id);
        let client = self.client(&cfg)?;
        let request = UploadRequest::from_attachment(attachment, &target, Utc::now());
        self.transfers
            .upload(
                &client,
                user_id,
                &request,
                &session,
                cfg.max_display_entries,
                outbox,
            )
            .await?;
        self.cache.invalidate(client.base_url(), &target, user_id);
        Ok(())
    }
}
