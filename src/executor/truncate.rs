//! Head/tail output truncation.

/// Share of the byte budget spent on leading lines; the rest goes to the
/// trailing lines.
const HEAD_PERCENT: usize = 60;

/// Shortens `raw` to roughly `max_bytes` by keeping whole lines from the
/// start and the end and replacing the middle with a marker.
///
/// Input that already fits is returned unchanged, so applying this twice
/// with the same budget is harmless. Lines are never split, which also
/// means a UTF-8 character is never split.
///
/// ```
/// use polyrun::executor::truncate::smart_truncate;
///
/// let raw: String = (1..=100).map(|i| format!("line {i}\n")).collect();
/// let short = smart_truncate(&raw, 200);
/// assert!(short.starts_with("line 1\n"));
/// assert!(short.ends_with("line 100\n"));
/// assert!(short.contains("lines /"));
/// ```
pub fn smart_truncate(raw: &str, max_bytes: usize) -> String {
    if raw.len() <= max_bytes {
        return raw.to_string();
    }

    let lines: Vec<&str> = raw.split('\n').collect();
    let head_budget = max_bytes * HEAD_PERCENT / 100;
    let tail_budget = max_bytes - head_budget;

    // Each kept line costs its length plus the newline joining it.
    let mut head_count = 0;
    let mut used = 0;
    for line in &lines {
        let cost = line.len() + 1;
        if used + cost > head_budget {
            break;
        }
        used += cost;
        head_count += 1;
    }

    let mut tail_count = 0;
    used = 0;
    for line in lines[head_count..].iter().rev() {
        let cost = line.len() + 1;
        if used + cost > tail_budget {
            break;
        }
        used += cost;
        tail_count += 1;
    }

    let tail_start = lines.len() - tail_count;
    let head = lines[..head_count].join("\n");
    let omitted = lines[head_count..tail_start].join("\n");
    let tail = lines[tail_start..].join("\n");

    // An empty final element is the trailing newline, not a line.
    let shown_tail = if raw.ends_with('\n') {
        tail_count.saturating_sub(1)
    } else {
        tail_count
    };

    format!(
        "{}\n\n... [{} lines / {} bytes omitted; showing first {} + last {} lines] ...\n\n{}",
        head,
        tail_start - head_count,
        omitted.len(),
        head_count,
        shown_tail,
        tail
    )
}
