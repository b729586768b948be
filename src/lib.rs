// src/lib.rs

#![doc = r#"
# afr

Live-reload broadcaster. A [`broad::Broad`] hub keeps a registry of
subscribed browsers and pushes change messages to them over
server-sent events; the browser script it serves reloads the page or swaps
stylesheets in place. Optionally the same server resolves and serves static
files and watches them for changes.

## Modules

- [`broad`]: Client registry and the hub's HTTP routes.
- [`client`]: One subscriber connection (stream or one-shot).
- [`config`]: Configuration loading and merging from CLI, file, and environment.
- [`content_type`]: Extension to MIME type table.
- [`dir`]: Served directories, allow-tests and request path cleaning.
- [`error`]: Crate error type.
- [`msg`]: Message wire format and the reaction a page applies to it.
- [`receiver`]: Reconnecting event-stream receiver.
- [`remote`]: Locating and messaging a running hub.
- [`resolve`]: Path and static-site resolution over one or more directories.
- [`serve`]: File-serving responses.
- [`watcher`]: File system watcher producing change messages.
- [`web`]: Server wiring and graceful shutdown.
"#]

pub mod broad;
pub mod client;
pub mod config;
pub mod content_type;
pub mod dir;
pub mod error;
pub mod msg;
pub mod receiver;
pub mod remote;
pub mod resolve;
pub mod serve;
pub mod watcher;
pub mod web;
