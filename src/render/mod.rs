//! Template renderer.
//!
//! # Data Flow
//! ```text
//! per resource view (ServerDescriptor[] + DirectiveBundle):
//!     backend.j2 / proxy_pass.j2   → location fragments
//!     deny_list.j2 / allow_list.j2 / redirect.j2 → server-scope fragments
//!     server.j2                    → one block per ServerDescriptor
//!     upstream.j2                  → weighted upstream, if any
//! all views (sorted by namespace/name)
//!     → nginx.conf.j2              → RenderedConfiguration { text, fingerprint }
//! ```
//!
//! # Design Decisions
//! - Pure: output depends only on inputs and template sources
//! - Templates are embedded; a directory may override any of them
//! - Strict undefined behaviour; a missing field fails the whole render

mod fingerprint;

use std::fs;
use std::path::{Path, PathBuf};

use minijinja::value::Value;
use minijinja::{context, AutoEscape, Environment, UndefinedBehavior};
use thiserror::Error;

use crate::annotations::{DirectiveBundle, ProxyPass};
use crate::builder::{BackendDescriptor, ServerDescriptor};
use crate::config::TemplateConfig;
use crate::resource::{PathType, ResourceKey};

pub use fingerprint::Fingerprint;

pub const MASTER_TEMPLATE: &str = "nginx.conf.j2";
pub const SERVER_TEMPLATE: &str = "server.j2";
pub const BACKEND_TEMPLATE: &str = "backend.j2";
pub const UPSTREAM_TEMPLATE: &str = "upstream.j2";
pub const ALLOW_LIST_TEMPLATE: &str = "allow_list.j2";
pub const DENY_LIST_TEMPLATE: &str = "deny_list.j2";
pub const REDIRECT_TEMPLATE: &str = "redirect.j2";
pub const PROXY_PASS_TEMPLATE: &str = "proxy_pass.j2";

const EMBEDDED: &[(&str, &str)] = &[
    (MASTER_TEMPLATE, include_str!("templates/nginx.conf.j2")),
    (SERVER_TEMPLATE, include_str!("templates/server.j2")),
    (BACKEND_TEMPLATE, include_str!("templates/backend.j2")),
    (UPSTREAM_TEMPLATE, include_str!("templates/upstream.j2")),
    (ALLOW_LIST_TEMPLATE, include_str!("templates/allow_list.j2")),
    (DENY_LIST_TEMPLATE, include_str!("templates/deny_list.j2")),
    (REDIRECT_TEMPLATE, include_str!("templates/redirect.j2")),
    (PROXY_PASS_TEMPLATE, include_str!("templates/proxy_pass.j2")),
];

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to read template {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("template {name} failed: {source}")]
    Template {
        name: String,
        #[source]
        source: minijinja::Error,
    },
}

/// Full configuration text plus its fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfiguration {
    pub text: String,
    pub fingerprint: Fingerprint,
}

impl RenderedConfiguration {
    pub fn new(text: String) -> Self {
        let fingerprint = Fingerprint::of(text.as_bytes());
        Self { text, fingerprint }
    }
}

/// Rendered state of one routing resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceView {
    pub key: ResourceKey,
    pub servers: Vec<ServerDescriptor>,
    pub bundle: DirectiveBundle,
}

/// Master-template settings.
#[derive(Debug, Clone)]
struct MasterSettings {
    worker_processes: String,
    worker_connections: u32,
    pid_file: PathBuf,
}

pub struct Renderer {
    env: Environment<'static>,
    settings: MasterSettings,
}

impl Renderer {
    /// Load templates, letting files in `config.dir` replace embedded ones.
    pub fn new(config: &TemplateConfig, pid_file: &Path) -> Result<Self, RenderError> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);

        for (name, embedded) in EMBEDDED {
            let source = match &config.dir {
                Some(dir) if dir.join(name).is_file() => {
                    let path = dir.join(name);
                    tracing::debug!(template = %path.display(), "Using template override");
                    fs::read_to_string(&path).map_err(|source| RenderError::Io {
                        path: path.display().to_string(),
                        source,
                    })?
                }
                _ => (*embedded).to_string(),
            };
            env.add_template_owned(*name, source)
                .map_err(|source| template_error(name, source))?;
        }

        Ok(Self {
            env,
            settings: MasterSettings {
                worker_processes: config.worker_processes.clone(),
                worker_connections: config.worker_connections,
                pid_file: pid_file.to_path_buf(),
            },
        })
    }

    /// Renderer with the embedded templates and default settings.
    pub fn embedded(pid_file: &Path) -> Result<Self, RenderError> {
        Self::new(&TemplateConfig::default(), pid_file)
    }

    /// Render the configuration for a single resource.
    pub fn render(
        &self,
        servers: &[ServerDescriptor],
        bundle: &DirectiveBundle,
    ) -> Result<RenderedConfiguration, RenderError> {
        self.compose([(servers, bundle)])
    }

    /// Render every view into one document, ordered by resource key.
    pub fn render_all(&self, views: &[ResourceView]) -> Result<RenderedConfiguration, RenderError> {
        let mut ordered: Vec<&ResourceView> = views.iter().collect();
        ordered.sort_by(|a, b| a.key.cmp(&b.key));
        self.compose(
            ordered
                .into_iter()
                .map(|view| (view.servers.as_slice(), &view.bundle)),
        )
    }

    /// Master document with no servers, installed before the first launch.
    pub fn render_empty(&self) -> Result<RenderedConfiguration, RenderError> {
        self.compose(std::iter::empty())
    }

    fn compose<'a>(
        &self,
        views: impl IntoIterator<Item = (&'a [ServerDescriptor], &'a DirectiveBundle)>,
    ) -> Result<RenderedConfiguration, RenderError> {
        let mut upstreams = Vec::new();
        let mut servers = Vec::new();

        for (descriptors, bundle) in views {
            if let Some(weight) = &bundle.weight {
                upstreams.push(self.fragment(UPSTREAM_TEMPLATE, context! { weight => weight })?);
            }
            for server in descriptors {
                servers.push(self.server(server, bundle)?);
            }
        }

        let mut text = self.fragment(
            MASTER_TEMPLATE,
            context! {
                worker_processes => &self.settings.worker_processes,
                worker_connections => self.settings.worker_connections,
                pid_file => self.settings.pid_file.display().to_string(),
                upstreams => upstreams,
                servers => servers,
            },
        )?;
        text.push('\n');
        Ok(RenderedConfiguration::new(text))
    }

    fn server(
        &self,
        server: &ServerDescriptor,
        bundle: &DirectiveBundle,
    ) -> Result<String, RenderError> {
        let mut directives = Vec::new();
        if let Some(deny) = &bundle.deny_list {
            directives.push(self.fragment(DENY_LIST_TEMPLATE, context! { sources => deny })?);
        }
        if let Some(allow) = &bundle.allow_list {
            directives.push(self.fragment(ALLOW_LIST_TEMPLATE, context! { sources => allow })?);
        }
        if let Some(redirect) = &bundle.redirect {
            directives.push(self.fragment(REDIRECT_TEMPLATE, context! { redirect => redirect })?);
        }

        let regex = bundle.requires_regex_paths();
        let upstream = bundle.weight.as_ref().map(|w| w.upstream.as_str());
        let mut locations = server
            .backends
            .iter()
            .map(|backend| self.backend(backend, regex, upstream))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(proxy) = &bundle.proxy {
            locations.push(self.proxy_pass(proxy)?);
        }

        self.fragment(
            SERVER_TEMPLATE,
            context! {
                server => server,
                directives => directives,
                locations => locations,
            },
        )
    }

    fn backend(
        &self,
        backend: &BackendDescriptor,
        regex: bool,
        upstream: Option<&str>,
    ) -> Result<String, RenderError> {
        self.fragment(
            BACKEND_TEMPLATE,
            context! {
                backend => backend,
                location => location(&backend.path, backend.path_type, regex),
                upstream => upstream,
            },
        )
    }

    fn proxy_pass(&self, proxy: &ProxyPass) -> Result<String, RenderError> {
        self.fragment(
            PROXY_PASS_TEMPLATE,
            context! {
                proxy => proxy,
                location => location(&proxy.path, PathType::Prefix, proxy.regex),
                scheme => proxy.scheme(),
            },
        )
    }

    fn fragment(&self, name: &str, ctx: Value) -> Result<String, RenderError> {
        self.env
            .get_template(name)
            .and_then(|template| template.render(ctx))
            .map_err(|source| template_error(name, source))
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn template_error(name: &str, source: minijinja::Error) -> RenderError {
    RenderError::Template {
        name: name.to_string(),
        source,
    }
}

/// Location match expression for a path.
fn location(path: &str, path_type: PathType, regex: bool) -> String {
    if regex {
        return format!("~* \"^{}\"", path);
    }
    match path_type {
        PathType::Exact => format!("= {}", path),
        PathType::Prefix | PathType::ImplementationSpecific => path.to_string(),
    }
}
