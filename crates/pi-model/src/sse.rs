// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Server-sent-event line reassembly shared by the HTTP adapters.

use futures::{Stream, StreamExt};

/// Turn a streaming HTTP response into a stream of SSE `data:` payloads.
///
/// SSE lines can be split across TCP chunks, so a remainder buffer is
/// carried forward; only complete lines (terminated by `\n`) are parsed.
/// The `[DONE]` sentinel used by OpenAI-style endpoints is filtered out —
/// adapters treat end-of-stream as the terminator.
pub(crate) fn sse_data_lines(
    resp: reqwest::Response,
) -> impl Stream<Item = anyhow::Result<String>> + Send {
    resp.bytes_stream()
        .scan(String::new(), |buf, chunk| {
            let mut out: Vec<anyhow::Result<String>> = Vec::new();
            match chunk {
                Ok(bytes) => {
                    buf.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = buf.find('\n') {
                        let line = buf[..pos].trim_end_matches('\r').to_string();
                        buf.drain(..=pos);
                        if let Some(data) = line.strip_prefix("data:") {
                            let data = data.trim();
                            if !data.is_empty() && data != "[DONE]" {
                                out.push(Ok(data.to_string()));
                            }
                        }
                    }
                }
                Err(e) => out.push(Err(anyhow::anyhow!(e))),
            }
            futures::future::ready(Some(out))
        })
        .flat_map(futures::stream::iter)
}
