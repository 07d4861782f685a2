use std::path::Path;

/// Multi-command server binary built from the source tree. Its first
/// argument names the component, so that is what gets shown in logs.
pub const ROOT_SERVER: &str = "cluster-server";

/// Derive the `[tag]` shown in front of a child's output.
///
/// - `sudo -u user -E K=V prog ...` is tagged as `prog`
/// - `strip` prefixes (the bin directories) are removed
/// - `bundle exec X ...` becomes `X@<basename of dir>`
/// - `cluster-server component ...` becomes `component`
/// - a relative `dir` is prepended as `dir: tag`
pub fn log_tag<S: AsRef<str>>(program: &str, args: &[S], dir: &str, strip: &[String]) -> String {
    let mut tag = program.to_string();
    let mut inner: &[S] = args;

    if tag == "sudo" {
        let mut i = 0;
        while i < args.len() {
            let arg = args[i].as_ref();
            if arg == "-u" {
                i += 1;
            } else if arg == "-E" || arg.contains('=') {
            } else {
                tag = arg.to_string();
                inner = &args[i + 1..];
                break;
            }
            i += 1;
        }
    }

    for prefix in strip {
        if let Some(rest) = tag.strip_prefix(prefix.as_str()) {
            tag = rest.to_string();
        }
    }

    if tag == "bundle" && inner.len() > 2 && inner[0].as_ref() == "exec" {
        let dirbase = Path::new(dir)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        tag = format!("{}@{}", inner[1].as_ref(), dirbase);
    } else if tag == ROOT_SERVER && args.len() > 1 {
        tag = args[0].as_ref().to_string();
    }

    if !dir.starts_with('/') {
        tag = format!("{}: {}", dir, tag);
    }
    tag
}
