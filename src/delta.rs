//! Delta-transfer algorithm
//!
//! rsync-style matching: the receiver publishes fixed-size block checksums
//! of its current copy, the sender slides a rolling checksum over its own
//! (newer) copy and emits block references for matching spans and literal
//! bytes for everything else. The receiver rebuilds the file with a
//! [`Patcher`].

use crate::checksum::{BlockChecksum, RollingChecksum};
use crate::hash::Digest;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

/// One instruction for rebuilding the sender's file on the receiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Copy `length` bytes from the receiver's current copy at `offset`
    Copy { offset: u64, length: u64 },
    /// Insert bytes that have no match on the receiver
    Literal(Vec<u8>),
}

impl DeltaOp {
    fn wire_len(&self) -> usize {
        match self {
            DeltaOp::Copy { .. } => 16,
            DeltaOp::Literal(data) => data.len(),
        }
    }
}

/// Delta-transfer algorithm for a fixed block size
pub struct DeltaAlgorithm {
    block_size: usize,
}

impl DeltaAlgorithm {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Checksum every block of `reader`; the final block may be short
    pub fn generate_checksums<R: Read>(&self, mut reader: R) -> Result<Vec<BlockChecksum>> {
        let mut checksums = Vec::new();
        let mut buf = vec![0u8; self.block_size];
        let mut offset = 0u64;

        loop {
            let n = read_block(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            checksums.push(BlockChecksum::of(offset, &buf[..n]));
            offset += n as u64;
            if n < self.block_size {
                break;
            }
        }

        Ok(checksums)
    }

    /// Compute the ops that turn the receiver's copy (described by
    /// `checksums`) into `source`
    pub fn compute_delta(&self, source: &[u8], checksums: &[BlockChecksum]) -> Vec<DeltaOp> {
        let mut ops = Vec::new();
        if source.is_empty() {
            return ops;
        }

        // Only full blocks take part in rolling matches
        let mut table: HashMap<u32, Vec<usize>> = HashMap::new();
        for (i, block) in checksums.iter().enumerate() {
            if block.length as usize == self.block_size {
                table.entry(block.weak).or_default().push(i);
            }
        }

        let mut last_match = 0usize;

        if !table.is_empty() && source.len() >= self.block_size {
            let end = source.len() + 1 - self.block_size;
            let mut offset = 0usize;
            let mut rolling = RollingChecksum::new(self.block_size);
            rolling.init(&source[..self.block_size]);

            while offset < end {
                let window = &source[offset..offset + self.block_size];
                let matched = table.get(&rolling.value()).and_then(|candidates| {
                    let strong = Digest::of(window);
                    candidates
                        .iter()
                        .map(|&i| &checksums[i])
                        .find(|block| block.strong == strong)
                });

                if let Some(block) = matched {
                    if offset > last_match {
                        push_literal(&mut ops, &source[last_match..offset]);
                    }
                    push_copy(&mut ops, block.offset, self.block_size as u64);

                    offset += self.block_size;
                    last_match = offset;
                    if offset < end {
                        rolling.init(&source[offset..offset + self.block_size]);
                    }
                    continue;
                }

                if offset + self.block_size < source.len() {
                    rolling.roll(source[offset], source[offset + self.block_size]);
                }
                offset += 1;
            }
        }

        // A short trailing block can still match the receiver's short tail
        let mut tail_end = source.len();
        if let Some(tail) = checksums.last().filter(|b| (b.length as usize) < self.block_size) {
            let len = tail.length as usize;
            if len > 0 && source.len() - last_match >= len {
                let candidate = &source[source.len() - len..];
                if Digest::of(candidate) == tail.strong {
                    tail_end = source.len() - len;
                    if tail_end > last_match {
                        push_literal(&mut ops, &source[last_match..tail_end]);
                    }
                    push_copy(&mut ops, tail.offset, len as u64);
                    last_match = source.len();
                }
            }
        }

        if last_match < tail_end {
            push_literal(&mut ops, &source[last_match..tail_end]);
        }

        ops
    }
}

fn push_copy(ops: &mut Vec<DeltaOp>, offset: u64, length: u64) {
    if let Some(DeltaOp::Copy {
        offset: prev_offset,
        length: prev_length,
    }) = ops.last_mut()
    {
        if *prev_offset + *prev_length == offset {
            *prev_length += length;
            return;
        }
    }
    ops.push(DeltaOp::Copy { offset, length });
}

fn push_literal(ops: &mut Vec<DeltaOp>, data: &[u8]) {
    if let Some(DeltaOp::Literal(prev)) = ops.last_mut() {
        prev.extend_from_slice(data);
        return;
    }
    ops.push(DeltaOp::Literal(data.to_vec()));
}

/// Fill `buf` from `reader`, stopping early only at EOF
fn read_block<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Split ops into batches of roughly `max_bytes` each, breaking up large
/// literals, so each batch fits one `BLOCK_DATA` frame
pub fn batch_ops(ops: Vec<DeltaOp>, max_bytes: usize) -> Vec<Vec<DeltaOp>> {
    let max_bytes = max_bytes.max(1);
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_len = 0usize;

    let mut flush = |current: &mut Vec<DeltaOp>, current_len: &mut usize| {
        if !current.is_empty() {
            batches.push(std::mem::take(current));
            *current_len = 0;
        }
    };

    for op in ops {
        match op {
            DeltaOp::Literal(data) if data.len() > max_bytes => {
                for piece in data.chunks(max_bytes) {
                    flush(&mut current, &mut current_len);
                    current.push(DeltaOp::Literal(piece.to_vec()));
                    current_len = piece.len();
                }
            }
            op => {
                if current_len + op.wire_len() > max_bytes {
                    flush(&mut current, &mut current_len);
                }
                current_len += op.wire_len();
                current.push(op);
            }
        }
    }
    flush(&mut current, &mut current_len);

    batches
}

/// Pack a batch of ops into a `BLOCK_DATA` payload
pub fn encode_ops(ops: &[DeltaOp]) -> Result<Vec<u8>> {
    bincode::serialize(ops).context("encode delta ops")
}

pub fn decode_ops(payload: &[u8]) -> Result<Vec<DeltaOp>> {
    bincode::deserialize(payload).context("decode delta ops")
}

/// Incremental reconstruction of the sender's file
pub struct Patcher<B, W> {
    basis: Option<B>,
    out: W,
    written: u64,
}

impl<B: Read + Seek, W: Write> Patcher<B, W> {
    /// `basis` is the receiver's current copy, if it has one
    pub fn new(basis: Option<B>, out: W) -> Self {
        Self {
            basis,
            out,
            written: 0,
        }
    }

    pub fn apply(&mut self, op: &DeltaOp) -> Result<()> {
        match op {
            DeltaOp::Copy { offset, length } => {
                let Some(basis) = self.basis.as_mut() else {
                    bail!("block reference at {offset} but there is no local copy");
                };
                basis.seek(SeekFrom::Start(*offset))?;
                let copied = std::io::copy(&mut basis.by_ref().take(*length), &mut self.out)?;
                if copied != *length {
                    bail!(
                        "local copy too short: wanted {length} bytes at {offset}, got {copied}"
                    );
                }
                self.written += copied;
            }
            DeltaOp::Literal(data) => {
                self.out.write_all(data)?;
                self.written += data.len() as u64;
            }
        }
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and hand back the output
    pub fn finish(mut self) -> Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn rebuild(basis: &[u8], ops: &[DeltaOp]) -> Vec<u8> {
        let mut patcher = Patcher::new(Some(Cursor::new(basis.to_vec())), Vec::new());
        for op in ops {
            patcher.apply(op).unwrap();
        }
        patcher.finish().unwrap()
    }

    fn sample(len: usize, seed: u32) -> Vec<u8> {
        let mut x = seed;
        (0..len)
            .map(|_| {
                x = x.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (x >> 16) as u8
            })
            .collect()
    }

    #[test]
    fn test_generate_checksums() {
        let algorithm = DeltaAlgorithm::new(4);
        let checksums = algorithm
            .generate_checksums(&b"Hello, World!"[..])
            .unwrap();

        // ceil(13/4) = 4 blocks, last one short
        assert_eq!(checksums.len(), 4);
        assert_eq!(checksums[0].length, 4);
        assert_eq!(checksums[0].offset, 0);
        assert_eq!(checksums[3].length, 1);
        assert_eq!(checksums[3].offset, 12);
    }

    #[test]
    fn test_identical_files_are_all_copies() {
        let algorithm = DeltaAlgorithm::new(64);
        let data = sample(64 * 10 + 17, 1);
        let checksums = algorithm.generate_checksums(&data[..]).unwrap();

        let ops = algorithm.compute_delta(&data, &checksums);
        assert!(ops.iter().all(|op| matches!(op, DeltaOp::Copy { .. })));
        assert_eq!(rebuild(&data, &ops), data);
    }

    #[test]
    fn test_no_basis_is_one_literal() {
        let algorithm = DeltaAlgorithm::new(4);
        let ops = algorithm.compute_delta(b"Hello, World!", &[]);
        assert_eq!(ops, vec![DeltaOp::Literal(b"Hello, World!".to_vec())]);
    }

    #[test]
    fn test_insertion_reuses_surrounding_blocks() {
        let algorithm = DeltaAlgorithm::new(32);
        let old = sample(32 * 20, 7);
        let mut new = old.clone();
        new.splice(100..100, b"inserted in the middle".iter().copied());

        let checksums = algorithm.generate_checksums(&old[..]).unwrap();
        let ops = algorithm.compute_delta(&new, &checksums);

        let literal_bytes: usize = ops
            .iter()
            .map(|op| match op {
                DeltaOp::Literal(d) => d.len(),
                DeltaOp::Copy { .. } => 0,
            })
            .sum();
        assert!(literal_bytes < 32 * 3, "sent {literal_bytes} literal bytes");
        assert_eq!(rebuild(&old, &ops), new);
    }

    #[test]
    fn test_shrunk_and_truncated_file() {
        let algorithm = DeltaAlgorithm::new(16);
        let old = sample(500, 3);
        let new = old[40..300].to_vec();
        let checksums = algorithm.generate_checksums(&old[..]).unwrap();
        let ops = algorithm.compute_delta(&new, &checksums);
        assert_eq!(rebuild(&old, &ops), new);
    }

    #[test]
    fn test_batches_preserve_content() {
        let ops = vec![
            DeltaOp::Literal(vec![1u8; 250]),
            DeltaOp::Copy { offset: 0, length: 8 },
            DeltaOp::Literal(vec![2u8; 10]),
        ];
        let batches = batch_ops(ops.clone(), 100);
        assert!(batches.len() >= 3);

        let flattened: Vec<u8> = batches
            .iter()
            .flatten()
            .filter_map(|op| match op {
                DeltaOp::Literal(d) => Some(d.clone()),
                DeltaOp::Copy { .. } => None,
            })
            .flatten()
            .collect();
        assert_eq!(flattened.len(), 260);

        let payload = encode_ops(&batches[0]).unwrap();
        assert_eq!(decode_ops(&payload).unwrap(), batches[0]);
    }

    #[test]
    fn test_copy_without_basis_fails() {
        let mut patcher: Patcher<Cursor<Vec<u8>>, Vec<u8>> = Patcher::new(None, Vec::new());
        assert!(patcher
            .apply(&DeltaOp::Copy { offset: 0, length: 4 })
            .is_err());
    }
}
