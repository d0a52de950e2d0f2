//! Line-range reads with optional `cat -n` style numbering.

use super::FsError;

/// Lines longer than this many characters are wrapped when numbered.
pub const MAX_LINE_LEN: usize = 80;

const LINE_NUM_WIDTH: usize = 4;

/// Options for [`LocalFs::read_file`](super::LocalFs::read_file).
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Line offset to start reading from (0-indexed)
    pub offset: usize,
    /// Maximum number of lines to return, `None` for the rest of the file
    pub limit: Option<usize>,
    /// Prefix every line with its 1-based number
    pub numbered: bool,
}

/// Slice `content` into the requested line range.
pub(crate) fn read_lines(content: &str, opts: &ReadOptions) -> Result<String, FsError> {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return Ok(String::new());
    }
    if opts.offset >= lines.len() {
        return Err(FsError::OffsetOutOfRange {
            offset: opts.offset,
            lines: lines.len(),
        });
    }

    let end = match opts.limit {
        Some(limit) => opts.offset.saturating_add(limit).min(lines.len()),
        None => lines.len(),
    };
    let selected = &lines[opts.offset..end];
    if opts.numbered {
        Ok(format_numbered(selected, opts.offset + 1))
    } else {
        Ok(selected.join("\n"))
    }
}

/// Number lines starting at `start_line`.
///
/// Long lines are split into chunks of [`MAX_LINE_LEN`] characters; the
/// first chunk carries the line number and the rest carry `N.k` labels.
pub fn format_numbered(lines: &[&str], start_line: usize) -> String {
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        let num = start_line + i;
        let chars: Vec<char> = line.chars().collect();
        if chars.len() <= MAX_LINE_LEN {
            out.push(format!("{num:>LINE_NUM_WIDTH$}\t{line}"));
            continue;
        }
        for (k, chunk) in chars.chunks(MAX_LINE_LEN).enumerate() {
            let chunk: String = chunk.iter().collect();
            if k == 0 {
                out.push(format!("{num:>LINE_NUM_WIDTH$}\t{chunk}"));
            } else {
                let label = format!("{num}.{k}");
                out.push(format!("{label:>LINE_NUM_WIDTH$}\t{chunk}"));
            }
        }
    }
    out.join("\n")
}
