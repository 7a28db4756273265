//! Build recipes: Dockerfile templates and sanitization of user recipes

use crate::models::app_type::AppType;

/// Recipe file name looked up in, and generated into, the source tree
pub const RECIPE_FILE: &str = "Dockerfile";

/// Build-context ignore file generated next to a synthesized recipe
pub const IGNORE_FILE: &str = ".dockerignore";

/// Conventional entry files, in priority order
pub const ENTRY_CANDIDATES: &[&str] = &[
    "src/index.ts",
    "src/server.ts",
    "src/main.ts",
    "src/app.ts",
    "index.ts",
    "server.ts",
    "src/index.js",
    "src/server.js",
    "index.js",
    "server.js",
    "app.js",
    "main.js",
];

/// Prefix written in front of every neutralized instruction line
pub const REMOVED_MARKER: &str = "# [dockyard] removed: ";

const NODE_IMAGE: &str = "node:20-alpine";
const STATIC_IMAGE: &str = "nginx:alpine";

/// Build context exclusions for synthesized builds
pub const DEFAULT_IGNORE: &str = "node_modules\n.git\n.env\n.env.*\nnpm-debug.log*\nDockerfile\n.dockerignore\n";

/// Substrings that reference host escape vectors or request elevated
/// sandboxes
const ESCAPE_PATTERNS: &[&str] = &[
    "docker.sock",
    "/var/run/docker",
    "containerd.sock",
    "--privileged",
    "--security=insecure",
    "--network=host",
    "/proc/sys",
    "/sys/fs/cgroup",
    "/dev/mem",
    "/dev/kmem",
    "/dev/kmsg",
    "/dev/sd",
    "/dev/nvme",
    "/dev/disk",
];

/// Commands that switch or escalate privileges
const PRIVILEGE_COMMANDS: &[&str] = &["sudo", "su", "doas", "nsenter", "setcap"];

/// Command the container starts with for a server application.
///
/// `entry` is the first of [`ENTRY_CANDIDATES`] present in the source tree.
pub fn start_command(app_type: AppType, entry: Option<&str>, has_start_script: bool) -> Vec<String> {
    let cmd: Vec<&str> = match (app_type, entry) {
        (AppType::Nextjs, _) => vec!["npm", "start"],
        (AppType::Nestjs, _) => vec!["node", "dist/main.js"],
        (_, Some(entry)) if entry.ends_with(".ts") => vec!["npx", "tsx", entry],
        (_, Some(entry)) => vec!["node", entry],
        (_, None) if has_start_script => vec!["npm", "start"],
        (_, None) => vec!["node", "index.js"],
    };
    cmd.into_iter().map(String::from).collect()
}

/// Synthesize a Dockerfile for an application type
pub fn synthesize(app_type: AppType, port: u16, start: &[String]) -> String {
    if let Some(output_dir) = app_type.build_output_dir() {
        return spa_template(output_dir, port);
    }
    if app_type.is_static() {
        return static_template(port);
    }
    server_template(port, start)
}

fn nginx_config(port: u16) -> String {
    format!(
        "RUN printf 'server {{\\n  listen {port};\\n  root /usr/share/nginx/html;\\n  location / {{\\n    try_files $uri $uri/ /index.html;\\n  }}\\n}}\\n' > /etc/nginx/conf.d/default.conf\n"
    )
}

fn static_template(port: u16) -> String {
    let mut out = String::from("# Generated by dockyard\n");
    out.push_str(&format!("FROM {STATIC_IMAGE}\n"));
    out.push_str(&nginx_config(port));
    out.push_str("COPY . /usr/share/nginx/html\n");
    out.push_str(&format!("ENV PORT={port}\nEXPOSE {port}\n"));
    out.push_str("CMD [\"nginx\", \"-g\", \"daemon off;\"]\n");
    out
}

fn spa_template(output_dir: &str, port: u16) -> String {
    let mut out = String::from("# Generated by dockyard\n");
    out.push_str(&format!("FROM {NODE_IMAGE} AS builder\n"));
    out.push_str("WORKDIR /app\n");
    out.push_str("COPY package*.json ./\n");
    out.push_str("RUN npm ci || npm install\n");
    out.push_str("COPY . .\n");
    out.push_str("RUN npm run build\n\n");
    out.push_str(&format!("FROM {STATIC_IMAGE}\n"));
    out.push_str(&nginx_config(port));
    out.push_str(&format!("COPY --from=builder /app/{output_dir} /usr/share/nginx/html\n"));
    out.push_str(&format!("ENV PORT={port}\nEXPOSE {port}\n"));
    out.push_str("CMD [\"nginx\", \"-g\", \"daemon off;\"]\n");
    out
}

fn server_template(port: u16, start: &[String]) -> String {
    let cmd = start
        .iter()
        .map(|arg| format!("\"{}\"", arg.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(", ");

    let mut out = String::from("# Generated by dockyard\n");
    out.push_str(&format!("FROM {NODE_IMAGE} AS builder\n"));
    out.push_str("WORKDIR /app\n");
    out.push_str("COPY package*.json ./\n");
    out.push_str("RUN npm ci || npm install\n");
    out.push_str("COPY . .\n");
    out.push_str("RUN npm run build --if-present\n\n");
    out.push_str(&format!("FROM {NODE_IMAGE}\n"));
    out.push_str("WORKDIR /app\n");
    out.push_str("ENV NODE_ENV=production\n");
    out.push_str("COPY --from=builder /app ./\n");
    out.push_str(&format!("ENV PORT={port}\nEXPOSE {port}\n"));
    out.push_str(&format!("CMD [{cmd}]\n"));
    out
}

// ================================ SANITIZER ===================================== //

/// One logical Dockerfile unit: an instruction with its continuation lines,
/// or a standalone blank/comment line
struct Unit<'a> {
    lines: Vec<&'a str>,
    keyword: Option<String>,
}

impl Unit<'_> {
    /// Instruction text with continuations joined
    fn text(&self) -> String {
        self.lines
            .iter()
            .map(|line| line.trim().trim_end_matches('\\').trim())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Arguments following the keyword
    fn args(&self) -> String {
        let text = self.text();
        match text.split_once(char::is_whitespace) {
            Some((_, rest)) => rest.trim().to_string(),
            None => String::new(),
        }
    }
}

fn split_units(content: &str) -> Vec<Unit<'_>> {
    let mut units: Vec<Unit<'_>> = Vec::new();
    let mut continuing = false;

    for line in content.lines() {
        let trimmed = line.trim();
        if continuing {
            if let Some(unit) = units.last_mut() {
                unit.lines.push(line);
            }
            // comment and blank lines inside a continuation do not end it
            if !trimmed.is_empty() && !trimmed.starts_with('#') {
                continuing = trimmed.ends_with('\\');
            }
            continue;
        }

        if trimmed.is_empty() || trimmed.starts_with('#') {
            units.push(Unit {
                lines: vec![line],
                keyword: None,
            });
            continue;
        }

        let keyword = trimmed
            .split_whitespace()
            .next()
            .map(|word| word.to_ascii_uppercase());
        continuing = trimmed.ends_with('\\');
        units.push(Unit {
            lines: vec![line],
            keyword,
        });
    }

    units
}

/// Split on whitespace, keeping quoted sections together
fn split_words(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in s.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            None => {
                if c == '"' || c == '\'' {
                    quote = Some(c);
                }
                current.push(c);
            }
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn unquote(value: &str) -> &str {
    value.trim_matches(|c| c == '"' || c == '\'')
}

fn is_port_exposed(args: &str, port: u16) -> bool {
    let ports = split_words(args);
    let expected = port.to_string();
    ports.len() == 1 && {
        let value = ports[0].as_str();
        value == expected || value.eq_ignore_ascii_case(&format!("{expected}/tcp"))
    }
}

/// Rewrite an ENV unit assigning PORT. Returns `None` when the unit does not
/// assign PORT, `Some(None)` when it already assigns the right value.
fn rewrite_env(unit: &Unit<'_>, port: u16) -> Option<Option<String>> {
    let args = unit.args();
    let words = split_words(&args);
    let expected = port.to_string();
    let first = words.first()?;

    let keyword = unit.lines[0].split_whitespace().next().unwrap_or("ENV");

    if !first.contains('=') {
        // legacy `ENV KEY value` form
        if first != "PORT" {
            return None;
        }
        let value = words[1..].join(" ");
        if unquote(&value) == expected {
            return Some(None);
        }
        return Some(Some(format!("{keyword} PORT {expected}")));
    }

    let mut found = false;
    let mut changed = false;
    let rewritten: Vec<String> = words
        .iter()
        .map(|word| match word.split_once('=') {
            Some(("PORT", value)) => {
                found = true;
                if unquote(value) == expected {
                    word.clone()
                } else {
                    changed = true;
                    format!("PORT={expected}")
                }
            }
            _ => word.clone(),
        })
        .collect();

    if !found {
        return None;
    }
    if !changed {
        return Some(None);
    }
    Some(Some(format!("{keyword} {}", rewritten.join(" "))))
}

fn is_chmod_setid(words: &[&str]) -> bool {
    words.windows(2).any(|pair| {
        if pair[0] != "chmod" {
            return false;
        }
        let mode = pair[1];
        if mode.contains("+s") {
            return true;
        }
        mode.len() == 4
            && mode.chars().all(|c| c.is_ascii_digit())
            && matches!(mode.as_bytes()[0], b'2' | b'4' | b'6')
    })
}

/// Rewrite an `ONBUILD EXPOSE` or `ONBUILD ENV PORT` trigger. Returns `None`
/// when the wrapped instruction already complies or is not port related.
fn rewrite_onbuild(unit: &Unit<'_>, port: u16) -> Option<String> {
    let args = unit.args();
    let (inner, rest) = args.split_once(char::is_whitespace).unwrap_or((args.as_str(), ""));
    let inner = inner.to_ascii_uppercase();
    let rest = rest.trim();

    match inner.as_str() {
        "EXPOSE" if unit.lines.len() > 1 || !is_port_exposed(rest, port) => {
            Some(format!("ONBUILD EXPOSE {port}"))
        }
        "ENV" => {
            let text = format!("ENV {rest}");
            let wrapped = Unit {
                lines: vec![text.as_str()],
                keyword: Some(inner.clone()),
            };
            rewrite_env(&wrapped, port).flatten().map(|line| format!("ONBUILD {line}"))
        }
        _ => None,
    }
}

/// Whether an instruction escalates privilege or reaches for the host
fn is_dangerous(unit: &Unit<'_>) -> bool {
    let text = unit.text().to_lowercase();

    if unit.keyword.as_deref() == Some("USER") {
        let user = unit.args().to_lowercase();
        let name = user.split(':').next().unwrap_or("").trim();
        if name == "root" || name == "0" {
            return true;
        }
    }

    if ESCAPE_PATTERNS.iter().any(|pattern| text.contains(pattern)) {
        return true;
    }

    let words: Vec<&str> = text
        .split(|c: char| c.is_whitespace() || matches!(c, ';' | '&' | '|' | '(' | ')' | '"' | '\'' | ','))
        .filter(|word| !word.is_empty())
        .collect();

    words.iter().any(|word| PRIVILEGE_COMMANDS.contains(word)) || is_chmod_setid(&words)
}

/// Sanitize a user-supplied Dockerfile for the given internal port.
///
/// * every `EXPOSE` exposes exactly `port`, one is appended if missing
/// * every `ENV` assigning `PORT` assigns `port`; if none exists one is
///   inserted before the first `CMD`/`ENTRYPOINT`, or appended
/// * `ONBUILD` triggers wrapping `EXPOSE` or `ENV PORT` follow the same rules
/// * privilege escalation and host escape instructions are commented out
///
/// A recipe that already complies is returned unchanged. CRLF line endings
/// are kept.
pub fn sanitize(content: &str, port: u16) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut saw_expose = false;
    let mut saw_port_env = false;
    let mut entry_index: Option<usize> = None;

    for unit in split_units(content) {
        let Some(keyword) = unit.keyword.as_deref() else {
            out.extend(unit.lines.iter().map(|line| line.to_string()));
            continue;
        };

        if is_dangerous(&unit) {
            out.extend(unit.lines.iter().map(|line| format!("{REMOVED_MARKER}{line}")));
            continue;
        }

        if keyword == "ONBUILD" {
            if let Some(line) = rewrite_onbuild(&unit, port) {
                out.push(line);
                continue;
            }
        }

        match keyword {
            "EXPOSE" => {
                saw_expose = true;
                if unit.lines.len() == 1 && is_port_exposed(&unit.args(), port) {
                    out.push(unit.lines[0].to_string());
                } else {
                    out.push(format!("EXPOSE {port}"));
                }
            }
            "ENV" => match rewrite_env(&unit, port) {
                Some(rewritten) => {
                    saw_port_env = true;
                    match rewritten {
                        Some(line) => out.push(line),
                        None => out.extend(unit.lines.iter().map(|line| line.to_string())),
                    }
                }
                None => out.extend(unit.lines.iter().map(|line| line.to_string())),
            },
            "CMD" | "ENTRYPOINT" => {
                entry_index.get_or_insert(out.len());
                out.extend(unit.lines.iter().map(|line| line.to_string()));
            }
            _ => out.extend(unit.lines.iter().map(|line| line.to_string())),
        }
    }

    if !saw_port_env {
        let line = format!("ENV PORT={port}");
        match entry_index {
            Some(index) => out.insert(index, line),
            None => out.push(line),
        }
    }
    if !saw_expose {
        out.push(format!("EXPOSE {port}"));
    }

    let newline = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let mut result = out.join(newline);
    if content.ends_with('\n') || content.is_empty() {
        result.push_str(newline);
    }
    result
}
