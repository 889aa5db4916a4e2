/*
 * Copyright 2020 Joyent, Inc.
 */

//! Request normalisation and plugin dispatch.
//!
//! A request arrives as a signal string and a source string. The source may
//! be `FORMAT::path`, `DEVICE::rest`, a file path or `exp[/pass]`; the signal
//! may be a function call `FORMAT::function(name=value, ...)` and may end in a
//! subset such as `[0:10:2]`. Once normalised the request is resolved to a
//! built-in verb or to exactly one plugin.

use chrono::Utc;
use slog::{debug, Logger};

use crate::blocks::{NameValue, RequestData, SubsetDim};
use crate::errors::{codes, ErrorStack};
use crate::plugin::{PluginEntry, PluginInterface, PluginRegistry};

/// Sessions below this version use the reduced resolution path.
pub const MODERN_DISPATCH_VERSION: i32 = 6;
pub const MAX_SOURCE_LEN: usize = 1024;

/// Formats answered by the server itself.
const SERVER_FORMATS: [&str; 2] = ["SERVER", "HELP"];
const FORWARD_FORMAT: &str = "UDA";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Help,
    Version,
    BuildDate,
    Date,
    Ping,
    Plugins,
}

impl Verb {
    fn parse(name: &str) -> Option<Verb> {
        match name.to_ascii_lowercase().as_str() {
            "" | "help" => Some(Verb::Help),
            "version" => Some(Verb::Version),
            "builddate" => Some(Verb::BuildDate),
            "date" => Some(Verb::Date),
            "ping" => Some(Verb::Ping),
            "plugins" => Some(Verb::Plugins),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum Resolution<'r> {
    Builtin(Verb),
    Plugin(&'r PluginEntry),
    Unresolved(String),
}

/// Rewrites requests so they are served through another data server.
#[derive(Debug, Clone, Default)]
pub struct ProxyPolicy {
    pub proxy: Option<String>,
    pub this_server: Option<String>,
}

impl ProxyPolicy {
    /// Rewrite `request.source` to `UDA::<proxy>/<source>` when a proxy is
    /// configured. Returns whether the request was rewritten.
    pub fn apply(
        &self,
        request: &mut RequestData,
        version: i32,
        delimiter: &str,
    ) -> Result<bool, String> {
        let proxy = match &self.proxy {
            Some(proxy) => proxy,
            None => return Ok(false),
        };
        let redirect = format!("{}{}", FORWARD_FORMAT, delimiter);
        if starts_with_ignore_case(&request.source, &redirect)
            || is_server_request(&request.signal, delimiter)
        {
            return Ok(false);
        }
        if let Some(this) = &self.this_server {
            if request.source.contains(this.as_str()) {
                return Err(format!(
                    "source {} redirects back to this server",
                    request.source
                ));
            }
        }
        if version < MODERN_DISPATCH_VERSION {
            return Err(format!(
                "protocol version {} clients cannot be proxied",
                version
            ));
        }

        let source = format!("{}{}/{}", redirect, proxy, request.source);
        if source.len() > MAX_SOURCE_LEN {
            return Err("proxied source is too long".to_string());
        }
        request.source = source;
        Ok(true)
    }
}

fn starts_with_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.is_char_boundary(prefix.len())
        && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn is_server_request(signal: &str, delimiter: &str) -> bool {
    match signal.find(delimiter) {
        Some(idx) => SERVER_FORMATS
            .iter()
            .any(|f| signal[..idx].trim().eq_ignore_ascii_case(f)),
        None => false,
    }
}

/// Fill the structured fields of `request` from its signal and source.
pub fn normalise(
    request: &mut RequestData,
    delimiter: &str,
    registry: &PluginRegistry,
) -> Result<(), String> {
    if request.source.len() > MAX_SOURCE_LEN {
        return Err("source string is too long".to_string());
    }

    let signal = request.signal.trim().to_string();
    let signal = match signal.find('[') {
        Some(idx) if signal.ends_with(']') => {
            request.subset = parse_subset(&signal[idx..])?;
            signal[..idx].trim_end().to_string()
        }
        _ => signal,
    };

    match signal.find(delimiter) {
        Some(idx) => {
            let prefix = signal[..idx].trim();
            let call = signal[idx + delimiter.len()..].trim();
            request.format = prefix.to_string();
            parse_function(request, call)?;
        }
        None => {
            if let Some(open) = signal.find('(') {
                if signal.ends_with(')') && is_server_function(&signal[..open]) {
                    parse_function(request, &signal)?;
                }
            }
        }
    }
    request.signal = signal;

    let source = request.source.trim().to_string();
    parse_source(request, &source, delimiter, registry);
    Ok(())
}

fn is_server_function(name: &str) -> bool {
    Verb::parse(name.trim()).is_some() && !name.trim().is_empty()
}

fn parse_function(request: &mut RequestData, call: &str) -> Result<(), String> {
    let (name, args) = match call.find('(') {
        Some(open) => {
            if !call.ends_with(')') {
                return Err(format!("unbalanced parentheses in {}", call));
            }
            (&call[..open], &call[open + 1..call.len() - 1])
        }
        None => (call, ""),
    };
    request.function = name.trim().to_string();
    request.name_values = parse_name_values(args);
    Ok(())
}

fn parse_name_values(args: &str) -> Vec<NameValue> {
    args.split(',')
        .map(str::trim)
        .filter(|arg| !arg.is_empty())
        .map(|arg| match arg.find('=') {
            Some(eq) => NameValue {
                name: arg[..eq].trim().to_string(),
                value: arg[eq + 1..]
                    .trim()
                    .trim_matches(|c: char| c == '"' || c == '\'')
                    .to_string(),
            },
            None => NameValue {
                name: arg.to_string(),
                value: "true".to_string(),
            },
        })
        .collect()
}

/// Parse `[start:stop:stride][...]`; one bracket per dimension.
pub fn parse_subset(text: &str) -> Result<Vec<SubsetDim>, String> {
    let bad = || format!("malformed subset {}", text);
    let inner = text
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(bad)?;

    inner
        .split("][")
        .map(|dim| -> Result<SubsetDim, String> {
            let parts: Vec<&str> = dim.split(':').map(str::trim).collect();
            let number = |s: &str| -> Result<Option<usize>, String> {
                if s.is_empty() || s == "*" {
                    Ok(None)
                } else {
                    s.parse().map(Some).map_err(|_| bad())
                }
            };
            match *parts.as_slice() {
                [index] => {
                    let start = number(index)?.unwrap_or(0);
                    let stop = number(index)?.map(|i| i + 1);
                    Ok(SubsetDim {
                        start,
                        stop,
                        stride: 1,
                    })
                }
                [start, stop] | [start, stop, ""] => Ok(SubsetDim {
                    start: number(start)?.unwrap_or(0),
                    stop: number(stop)?,
                    stride: 1,
                }),
                [start, stop, stride] => Ok(SubsetDim {
                    start: number(start)?.unwrap_or(0),
                    stop: number(stop)?,
                    stride: number(stride)?.filter(|s| *s > 0).unwrap_or(1),
                }),
                _ => Err(bad()),
            }
        })
        .collect()
}

fn parse_source(
    request: &mut RequestData,
    source: &str,
    delimiter: &str,
    registry: &PluginRegistry,
) {
    if let Some(idx) = source.find(delimiter) {
        let prefix = source[..idx].trim();
        let rest = source[idx + delimiter.len()..].trim();
        if registry.is_format(prefix) {
            if request.format.is_empty() {
                request.format = prefix.to_string();
            }
            request.path = rest.to_string();
            set_file(request);
        } else {
            request.device = prefix.to_string();
            parse_source(request, rest, delimiter, registry);
        }
        return;
    }

    if source.starts_with('/') || source.starts_with('.') {
        request.path = source.to_string();
        set_file(request);
        return;
    }

    let mut parts = source.splitn(2, '/');
    let exp = parts.next().unwrap_or("").trim();
    match exp.parse::<i32>() {
        Ok(number) => {
            request.exp_number = number;
            if let Some(pass) = parts.next() {
                request.pass = pass.trim().parse().unwrap_or(-1);
            }
        }
        Err(_) => {
            request.path = source.to_string();
        }
    }
}

fn set_file(request: &mut RequestData) {
    request.file = request
        .path
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string();
}

fn extension(file: &str) -> Option<&str> {
    match file.rfind('.') {
        Some(idx) if idx + 1 < file.len() => Some(&file[idx + 1..]),
        _ => None,
    }
}

/// Choose what serves `request`.
///
/// Built-in verbs come first. Modern sessions then resolve by request id,
/// format, device and file extension in that order; sessions below
/// [`MODERN_DISPATCH_VERSION`] resolve only by request id or format.
pub fn resolve<'r>(
    request: &RequestData,
    registry: &'r PluginRegistry,
    version: i32,
) -> Resolution<'r> {
    if SERVER_FORMATS
        .iter()
        .any(|f| request.format.eq_ignore_ascii_case(f))
    {
        return match Verb::parse(&request.function) {
            Some(verb) => Resolution::Builtin(verb),
            None => Resolution::Unresolved(format!(
                "unknown server function {}",
                request.function
            )),
        };
    }
    if request.format.is_empty() && request.device.is_empty() {
        if let Some(verb) = Verb::parse(&request.function) {
            if !request.function.is_empty() {
                return Resolution::Builtin(verb);
            }
        }
    }

    if request.request != 0 {
        if let Some(entry) = registry.by_request(request.request) {
            return Resolution::Plugin(entry);
        }
    }
    if !request.format.is_empty() {
        return match registry.by_format(&request.format) {
            Some(entry) => Resolution::Plugin(entry),
            None => Resolution::Unresolved(format!(
                "no plugin for format {}",
                request.format
            )),
        };
    }
    if version < MODERN_DISPATCH_VERSION {
        return Resolution::Unresolved(format!(
            "no format given for {} (protocol version {})",
            request.signal, version
        ));
    }
    if !request.device.is_empty() {
        if let Some(entry) = registry.by_device(&request.device) {
            return Resolution::Plugin(entry);
        }
    }
    if let Some(entry) = extension(&request.file).and_then(|e| registry.by_extension(e)) {
        return Resolution::Plugin(entry);
    }
    Resolution::Unresolved(format!(
        "unable to identify a plugin for {} from {}",
        request.signal, request.source
    ))
}

pub struct Dispatcher<'a> {
    pub registry: &'a PluginRegistry,
    pub proxy: &'a ProxyPolicy,
    pub delimiter: &'a str,
    pub server_version: i32,
    pub log: &'a Logger,
}

impl<'a> Dispatcher<'a> {
    /// Apply the proxy policy and normalise. Failures are pushed on `errors`.
    pub fn prepare(
        &self,
        request: &mut RequestData,
        version: i32,
        errors: &mut ErrorStack,
    ) -> bool {
        if let Err(msg) = self.proxy.apply(request, version, self.delimiter) {
            errors.push_code("dispatch", codes::PROXY_REDIRECTION, &msg);
            return false;
        }
        if let Err(msg) = normalise(request, self.delimiter, self.registry) {
            errors.push_code("dispatch", codes::PROTOCOL_INCORRECT_REQUEST, &msg);
            return false;
        }
        true
    }

    /// Serve the prepared request, filling the interface's data block.
    /// Returns zero on success.
    pub fn execute(&self, iface: &mut PluginInterface<'_>, version: i32) -> i32 {
        fill_metadata(iface);

        match resolve(iface.request, self.registry, version) {
            Resolution::Builtin(verb) => {
                debug!(self.log, "answering built-in verb"; "verb" => ?verb);
                self.answer(verb, iface);
                0
            }
            Resolution::Plugin(entry) => {
                debug!(self.log, "calling plugin";
                    "format" => &entry.format, "request" => entry.request);
                let handler = match entry.handler() {
                    Some(handler) => handler,
                    None => {
                        iface.errors.push_code(
                            "dispatch",
                            codes::PLUGIN_NOT_OPERATIONAL,
                            &format!("plugin {} is not operational", entry.format),
                        );
                        return codes::PLUGIN_NOT_OPERATIONAL;
                    }
                };
                let status = handler.call(iface);
                if status != 0 && iface.errors.is_empty() {
                    iface.errors.push_code(
                        "dispatch",
                        codes::PLUGIN_FAILED,
                        &format!("plugin {} failed with status {}", entry.format, status),
                    );
                }
                status
            }
            Resolution::Unresolved(msg) => {
                iface
                    .errors
                    .push_code("dispatch", codes::UNKNOWN_FUNCTION, &msg);
                codes::UNKNOWN_FUNCTION
            }
        }
    }

    fn answer(&self, verb: Verb, iface: &mut PluginInterface<'_>) {
        match verb {
            Verb::Help => iface.data_block.set_text(&self.help_text()),
            Verb::Version => iface.data_block.set_scalar_i32(self.server_version),
            Verb::BuildDate => iface.data_block.set_text(build_date()),
            Verb::Date => iface.data_block.set_text(&Utc::now().to_rfc2822()),
            Verb::Ping => iface.data_block.set_scalar_i64(Utc::now().timestamp()),
            Verb::Plugins => iface.data_block.set_text(&self.plugin_listing()),
        }
    }

    fn help_text(&self) -> String {
        let d = self.delimiter;
        format!(
            "Data server {}, protocol version {}\n\
             Built-in functions:\n\
             \tSERVER{d}help()\tthis text\n\
             \tSERVER{d}version()\tserver protocol version\n\
             \tSERVER{d}builddate()\tbuild date\n\
             \tSERVER{d}date()\tcurrent server date\n\
             \tSERVER{d}ping()\tserver time in seconds\n\
             \tSERVER{d}plugins()\tregistered plugins\n",
            env!("CARGO_PKG_VERSION"),
            self.server_version,
            d = d
        )
    }

    fn plugin_listing(&self) -> String {
        self.registry
            .iter()
            .map(|e| {
                format!(
                    "{}\t{:?}\t{}\t{}\t{}\n",
                    e.format,
                    e.class,
                    e.request,
                    e.desc,
                    e.example
                )
            })
            .collect()
    }
}

fn build_date() -> &'static str {
    option_env!("DATASERVE_BUILD_DATE").unwrap_or("unknown")
}

fn fill_metadata(iface: &mut PluginInterface<'_>) {
    let request = iface.request;
    let source = &mut iface.metadata.data_source;
    source.exp_number = request.exp_number;
    source.pass = request.pass;
    source.archive = request.archive.clone();
    source.device_name = request.device.clone();
    source.format = request.format.clone();
    source.path = request.path.clone();
    source.filename = request.file.clone();

    iface.metadata.signal_desc.signal_name = request.signal.clone();
}
