// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::{Read, Write},
    sync::Arc,
};

use anyhow::Result;
use enum_dispatch::enum_dispatch;
use flate2::{
    Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status,
    read::GzDecoder, write::GzEncoder,
};

use crate::{
    error::WsError,
    ws::extension::{CompressMethod, DeflateParams},
};

/// RFC 7692 trailer stripped from every compressed message on the wire.
const DEFLATE_TAIL: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// External compression collaborator covering the methods the engine does
/// not implement itself (brotli, zstd, lz4, lzma, bzip2).
pub trait Compressor: Send + Sync {
    fn compress(&self, data: &[u8], method: CompressMethod) -> Result<Vec<u8>>;
    fn decompress(&self, data: &[u8], method: CompressMethod) -> Result<Vec<u8>>;
}

/// Per-message payload transform negotiated for one session.
#[enum_dispatch]
pub trait MessageCodec {
    fn method(&self) -> CompressMethod;
    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>, WsError>;
    fn decompress(&mut self, data: &[u8], limit: usize) -> Result<Vec<u8>, WsError>;
}

/// Negotiated codec backends.
#[enum_dispatch(MessageCodec)]
pub enum PayloadCodec {
    Deflate(DeflateCodec),
    Gzip(GzipCodec),
    External(ExternalCodec),
}

/// Builds the codec for a negotiated method. `own_reset` / `peer_reset`
/// carry the no-context-takeover flags mapped to this endpoint's direction.
pub fn build_codec(
    method: CompressMethod,
    own_reset: bool,
    peer_reset: bool,
    external: Option<Arc<dyn Compressor>>,
) -> Option<PayloadCodec> {
    match method {
        CompressMethod::None => None,
        CompressMethod::Deflate => {
            Some(PayloadCodec::Deflate(DeflateCodec::new(own_reset, peer_reset)))
        },
        CompressMethod::Gzip => Some(PayloadCodec::Gzip(GzipCodec)),
        other => external
            .map(|backend| PayloadCodec::External(ExternalCodec::new(other, backend))),
    }
}

/// Maps negotiated deflate parameters onto the takeover flags of one role.
pub fn takeover_flags(params: &DeflateParams, server_side: bool) -> (bool, bool) {
    if server_side {
        (params.server_no_context_takeover, params.client_no_context_takeover)
    } else {
        (params.client_no_context_takeover, params.server_no_context_takeover)
    }
}

/// Raw-deflate codec with sliding-window context retained across messages
/// unless the matching `no_context_takeover` flag was negotiated.
pub struct DeflateCodec {
    compressor: Compress,
    decompressor: Decompress,
    reset_compress: bool,
    reset_decompress: bool,
}

impl DeflateCodec {
    pub fn new(reset_compress: bool, reset_decompress: bool) -> Self {
        Self {
            compressor: Compress::new(Compression::default(), false),
            decompressor: Decompress::new(false),
            reset_compress,
            reset_decompress,
        }
    }
}

impl MessageCodec for DeflateCodec {
    fn method(&self) -> CompressMethod {
        CompressMethod::Deflate
    }

    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>, WsError> {
        let mut output = Vec::with_capacity(data.len() / 2 + 16);
        let before = self.compressor.total_in();
        while (self.compressor.total_in() - before) < data.len() as u64 {
            let offset = (self.compressor.total_in() - before) as usize;
            output.reserve(4096);
            match self
                .compressor
                .compress_vec(&data[offset..], &mut output, FlushCompress::None)
                .map_err(|e| WsError::DecodeError(e.to_string()))?
            {
                Status::Ok | Status::BufError => continue,
                Status::StreamEnd => break,
            }
        }
        while !output.ends_with(&DEFLATE_TAIL) {
            output.reserve(16);
            match self
                .compressor
                .compress_vec(&[], &mut output, FlushCompress::Sync)
                .map_err(|e| WsError::DecodeError(e.to_string()))?
            {
                Status::Ok | Status::BufError => continue,
                Status::StreamEnd => break,
            }
        }
        output.truncate(output.len().saturating_sub(DEFLATE_TAIL.len()));
        if self.reset_compress {
            self.compressor.reset();
        }
        Ok(output)
    }

    fn decompress(&mut self, data: &[u8], limit: usize) -> Result<Vec<u8>, WsError> {
        let mut input = Vec::with_capacity(data.len() + DEFLATE_TAIL.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&DEFLATE_TAIL);

        let mut output = Vec::with_capacity(data.len() * 2);
        let before_in = self.decompressor.total_in();
        loop {
            if output.len() > limit {
                return Err(WsError::DecodeError(
                    "decompressed message exceeds the buffer cap".to_string(),
                ));
            }
            let offset = (self.decompressor.total_in() - before_in) as usize;
            let before_out = self.decompressor.total_out();
            output.reserve(8192);
            let status = self
                .decompressor
                .decompress_vec(&input[offset..], &mut output, FlushDecompress::None)
                .map_err(|e| WsError::DecodeError(e.to_string()))?;
            let produced = self.decompressor.total_out() - before_out;
            let drained = (self.decompressor.total_in() - before_in) as usize
                >= input.len();
            match status {
                Status::StreamEnd => break,
                // Keep pumping until the stream stops producing: input can
                // be fully consumed while output is still buffered inside.
                Status::Ok | Status::BufError => {
                    if drained && produced == 0 {
                        break;
                    }
                },
            }
        }
        if self.reset_decompress {
            self.decompressor.reset(false);
        }
        Ok(output)
    }
}

/// Whole-message gzip codec; no cross-message context by construction.
pub struct GzipCodec;

impl MessageCodec for GzipCodec {
    fn method(&self) -> CompressMethod {
        CompressMethod::Gzip
    }

    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>, WsError> {
        let mut encoder = GzEncoder::new(
            Vec::with_capacity(data.len() / 2 + 32),
            Compression::default(),
        );
        encoder
            .write_all(data)
            .map_err(|e| WsError::DecodeError(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| WsError::DecodeError(e.to_string()))
    }

    fn decompress(&mut self, data: &[u8], limit: usize) -> Result<Vec<u8>, WsError> {
        let mut output = Vec::with_capacity(data.len() * 2);
        let mut decoder = GzDecoder::new(data).take(limit as u64 + 1);
        decoder
            .read_to_end(&mut output)
            .map_err(|e| WsError::DecodeError(e.to_string()))?;
        if output.len() > limit {
            return Err(WsError::DecodeError(
                "decompressed message exceeds the buffer cap".to_string(),
            ));
        }
        Ok(output)
    }
}

/// Adapter running a user-installed [`Compressor`] for one method.
pub struct ExternalCodec {
    method: CompressMethod,
    backend: Arc<dyn Compressor>,
}

impl ExternalCodec {
    pub fn new(method: CompressMethod, backend: Arc<dyn Compressor>) -> Self {
        Self { method, backend }
    }
}

impl MessageCodec for ExternalCodec {
    fn method(&self) -> CompressMethod {
        self.method
    }

    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>, WsError> {
        self.backend
            .compress(data, self.method)
            .map_err(|e| WsError::DecodeError(e.to_string()))
    }

    fn decompress(&mut self, data: &[u8], limit: usize) -> Result<Vec<u8>, WsError> {
        let output = self
            .backend
            .decompress(data, self.method)
            .map_err(|e| WsError::DecodeError(e.to_string()))?;
        if output.len() > limit {
            return Err(WsError::DecodeError(
                "decompressed message exceeds the buffer cap".to_string(),
            ));
        }
        Ok(output)
    }
}
