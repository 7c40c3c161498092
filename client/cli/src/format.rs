//! Human-readable replies

use crate::api::Entry;
use crate::config::EffectiveConfig;
use std::fmt::Write;

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn short_date(modified: &Option<String>) -> Option<&str> {
    modified
        .as_deref()
        .and_then(|m| m.split('T').next())
        .filter(|d| !d.is_empty())
}

fn long_date(modified: &str) -> String {
    modified
        .replace('T', " ")
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Numbered view of a directory. `shown` is the indexed view, `all` the full
/// listing it was cut from.
pub fn format_listing(
    path: &str,
    all: &[Entry],
    shown: &[Entry],
    back_levels: usize,
    from_cache: bool,
) -> String {
    if all.is_empty() {
        return format!("{}\n\n(empty directory)", path);
    }

    let mut out = format!("{}\n\n", path);
    for (i, entry) in shown.iter().enumerate() {
        let n = i + 1;
        if entry.is_dir {
            let _ = writeln!(out, "{:>2}. [dir] {}/", n, entry.name);
            if let Some(date) = short_date(&entry.modified) {
                let _ = writeln!(out, "      {}", date);
            }
        } else {
            let _ = writeln!(out, "{:>2}. {}", n, entry.name);
            let _ = write!(out, "      {}", format_size(entry.size));
            if let Some(date) = short_date(&entry.modified) {
                let _ = write!(out, " | {}", date);
            }
            out.push('\n');
        }
    }

    if all.len() > shown.len() {
        let _ = write!(out, "\n... {} more not shown\n", all.len() - shown.len());
    }

    let dirs = all.iter().filter(|e| e.is_dir).count();
    let _ = write!(out, "\n{} directories, {} files", dirs, all.len() - dirs);

    out.push_str("\n\nls <n>: open entry | quit: go back");
    if back_levels > 0 {
        let _ = write!(out, " ({} levels)", back_levels);
    }
    if from_cache {
        out.push_str("\n(cached)");
    }
    out
}

pub fn format_search(keyword: &str, parent: &str, results: &[Entry], max: usize) -> String {
    if results.is_empty() {
        return format!("no results for '{}'", keyword);
    }

    let mut out = format!("search: {} in {}\n\n", keyword, parent);
    for (i, entry) in results.iter().take(max).enumerate() {
        let tag = if entry.is_dir { "[dir] " } else { "" };
        let _ = writeln!(out, "{}. {}{}", i + 1, tag, entry.name);
        if let Some(parent) = &entry.parent {
            let _ = writeln!(out, "   in {}", parent);
        }
        if !entry.is_dir {
            let _ = writeln!(out, "   {}", format_size(entry.size));
        }
    }
    if results.len() > max {
        let _ = write!(out, "\n... {} more results not shown", results.len() - max);
    }
    out.trim_end().to_string()
}

pub fn format_info(path: &str, entry: &Entry, link: Option<&str>) -> String {
    let mut out = String::from("file info\n\n");
    let _ = writeln!(out, "name: {}", entry.name);
    let _ = writeln!(out, "type: {}", if entry.is_dir { "directory" } else { "file" });
    let _ = writeln!(out, "path: {}", path);
    if !entry.is_dir {
        let _ = writeln!(out, "size: {}", format_size(entry.size));
    }
    if let Some(modified) = entry.modified.as_deref().filter(|m| !m.is_empty()) {
        let _ = writeln!(out, "modified: {}", long_date(modified));
    }
    if let Some(provider) = entry.provider.as_deref().filter(|p| !p.is_empty()) {
        let _ = writeln!(out, "storage: {}", provider);
    }
    if let Some(link) = link {
        let _ = write!(out, "\ndownload:\n{}", link);
    }
    out.trim_end().to_string()
}

pub fn format_link(entry: &Entry, link: &str) -> String {
    format!(
        "download link\n\nfile: {}\nsize: {}\nlink: {}",
        entry.name,
        format_size(entry.size),
        link
    )
}

/// `config show`. Secrets are masked.
pub fn format_config(
    user_name: &str,
    cfg: &EffectiveConfig,
    isolation: bool,
    default_url: &str,
) -> String {
    let mask = |s: &str| if s.is_empty() { String::new() } else { "***".to_string() };
    let extensions: Vec<&str> = cfg.allowed_extensions.iter().map(String::as_str).collect();

    let mut out = format!("config for {}\n\n", user_name);
    let _ = writeln!(out, "alist_url: {}", cfg.server_url);
    let _ = writeln!(out, "username: {}", cfg.username);
    let _ = writeln!(out, "password: {}", mask(&cfg.password));
    let _ = writeln!(out, "token: {}", mask(&cfg.token));
    let _ = writeln!(out, "max_display_files: {}", cfg.max_display_entries);
    let _ = writeln!(out, "allowed_extensions: {}", extensions.join(","));
    let _ = writeln!(out, "enable_preview: {}", cfg.preview_enabled);

    if isolation {
        out.push_str("\nmode: per-user configuration");
        if !default_url.is_empty() {
            let _ = write!(out, "\ndefault server: {}", default_url);
        }
    } else {
        out.push_str("\nmode: shared global configuration");
    }
    out
}

pub fn setup_text() -> &'static str {
    "setup\n\n\
     1. server address:\n   config set alist_url http://your-server:5244\n\
     2. username (optional):\n   config set username your_username\n\
     3. password (optional):\n   config set password your_password\n\
     4. check the connection:\n   config test\n\
     5. start browsing:\n   ls /\n\n\
     servers without login only need alist_url"
}

pub fn upload_started(target: &str, timeout_secs: u64) -> String {
    format!(
        "upload mode on\n\ntarget: {}\n\nsend a file or image to upload it here.\n\
         upload mode ends by itself after {} minutes.\n\
         upload cancel: leave upload mode",
        target,
        (timeout_secs + 59) / 60
    )
}

pub fn help_text(isolation: bool, configured: bool) -> String {
    let mut out = String::from(
        "commands\n\n\
         config show                 show your settings\n\
         config setup                setup guide\n\
         config set <key> <value>    change a setting\n\
         config test                 test the connection\n\
         config clear_cache          drop your cached listings\n\n\
         ls [path]                   list a directory (numbered)\n\
         ls <n>                      open entry n (directories) or download it (files)\n\
         quit                        go back to the previous directory\n\n\
         search <keyword> [path]     search below path\n\
         info <path>                 file details and link\n\
         download <path|n>           link for a path, or download entry n\n\n\
         upload                      upload the next file/image you send here\n\
         upload cancel               leave upload mode\n",
    );

    if isolation {
        out.push_str("\nper-user mode: your settings only affect you");
        if !configured {
            out.push_str("\nnot configured yet, run: config setup");
        }
    } else {
        out.push_str("\nshared mode: all users use the administrator's server");
    }
    out
}
