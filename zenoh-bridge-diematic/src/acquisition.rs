//! Block acquisition: reads the configured register blocks with bounded
//! retries and tolerates partial failure.
//!
//! Each block moves through `Pending -> Reading -> {Success, Retrying ->
//! Reading, Exhausted}`. A block that exhausts its attempts leaves its
//! slots unknown; the remaining blocks are still read.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::registers::RawRegisterArray;
use crate::schema::Schema;
use crate::transport::{RegisterReader, TransportError};

/// Largest number of holding registers a single Modbus read may request.
pub const MAX_BLOCK_COUNT: u16 = 125;

/// A contiguous range of register addresses read in one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// First register address.
    pub start: u16,
    /// Number of registers.
    pub count: u16,
}

impl Block {
    pub const fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    /// One past the last address of the block.
    pub fn end(&self) -> usize {
        usize::from(self.start) + usize::from(self.count)
    }

    pub fn contains(&self, address: u16) -> bool {
        address >= self.start && usize::from(address) < self.end()
    }

    pub fn overlaps(&self, other: &Block) -> bool {
        usize::from(self.start) < other.end() && usize::from(other.start) < self.end()
    }
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "{}..{}", self.start, self.start)
        } else {
            write!(f, "{}..={}", self.start, self.end() - 1)
        }
    }
}

/// Register layout of the Diematic 3 controller: 600..=620 and 700..=706.
pub fn default_blocks() -> Vec<Block> {
    vec![Block::new(600, 21), Block::new(700, 7)]
}

/// Terminal state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Success,
    Exhausted,
}

/// How a block's acquisition ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOutcome {
    pub block: Block,
    /// Read attempts made, including the successful one.
    pub attempts: u32,
    pub status: BlockStatus,
}

/// Result of one acquisition cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquisition {
    pub registers: RawRegisterArray,
    pub outcomes: Vec<BlockOutcome>,
}

impl Acquisition {
    /// Whether every block was read.
    pub fn is_complete(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| o.status == BlockStatus::Success)
    }

    /// Blocks whose attempts were exhausted.
    pub fn failed_blocks(&self) -> impl Iterator<Item = &Block> {
        self.outcomes
            .iter()
            .filter(|o| o.status == BlockStatus::Exhausted)
            .map(|o| &o.block)
    }
}

/// Fixed blocks and retry bound, sized against a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionPlan {
    blocks: Vec<Block>,
    retries: u32,
    len: usize,
}

impl AcquisitionPlan {
    /// Plan reads of `blocks` with up to `retries` attempts each.
    ///
    /// The register array covers every address referenced by the schema or
    /// by a block, whichever reaches higher.
    pub fn new(schema: &Schema, blocks: Vec<Block>, retries: u32) -> Self {
        let blocks_end = blocks.iter().map(Block::end).max().unwrap_or(0);
        Self {
            len: schema.register_span().max(blocks_end),
            blocks,
            retries,
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Length of the register arrays this plan produces.
    pub fn array_len(&self) -> usize {
        self.len
    }

    /// An acquisition where nothing could be read (e.g. the port did not open).
    pub fn unread(&self) -> Acquisition {
        Acquisition {
            registers: RawRegisterArray::new(self.len),
            outcomes: self
                .blocks
                .iter()
                .map(|block| BlockOutcome {
                    block: *block,
                    attempts: 0,
                    status: BlockStatus::Exhausted,
                })
                .collect(),
        }
    }

    /// Read every block in order on `reader`.
    ///
    /// Never fails: blocks that exhaust their attempts are left unknown.
    pub async fn acquire<R: RegisterReader>(&self, reader: &mut R) -> Acquisition {
        let mut registers = RawRegisterArray::new(self.len);
        let mut outcomes = Vec::with_capacity(self.blocks.len());

        for block in &self.blocks {
            let outcome = self.read_block(reader, block, &mut registers).await;
            if outcome.status == BlockStatus::Exhausted {
                error!(
                    block = %block,
                    attempts = outcome.attempts,
                    "Register block unreadable, values left unknown"
                );
            }
            outcomes.push(outcome);
        }

        Acquisition {
            registers,
            outcomes,
        }
    }

    async fn read_block<R: RegisterReader>(
        &self,
        reader: &mut R,
        block: &Block,
        registers: &mut RawRegisterArray,
    ) -> BlockOutcome {
        let mut attempts = 0;

        while attempts < self.retries {
            attempts += 1;
            debug!(block = %block, attempt = attempts, "Reading register block");

            let result = reader
                .read_holding_registers(block.start, block.count)
                .await
                .and_then(|words| {
                    if words.len() == usize::from(block.count) {
                        Ok(words)
                    } else {
                        Err(TransportError::Length {
                            expected: block.count,
                            actual: words.len(),
                        })
                    }
                });

            match result {
                Ok(words) => {
                    registers.fill(block.start, &words);
                    return BlockOutcome {
                        block: *block,
                        attempts,
                        status: BlockStatus::Success,
                    };
                }
                Err(e) => {
                    warn!(block = %block, attempt = attempts, error = %e, "Block read failed");
                }
            }
        }

        BlockOutcome {
            block: *block,
            attempts,
            status: BlockStatus::Exhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RegisterEntry;
    use std::collections::VecDeque;

    /// Replies with queued results, then with `fallback`.
    struct ScriptedReader {
        replies: VecDeque<Result<Vec<u16>, TransportError>>,
        calls: Vec<(u16, u16)>,
    }

    impl ScriptedReader {
        fn new(replies: Vec<Result<Vec<u16>, TransportError>>) -> Self {
            Self {
                replies: replies.into(),
                calls: Vec::new(),
            }
        }
    }

    impl RegisterReader for ScriptedReader {
        async fn read_holding_registers(
            &mut self,
            address: u16,
            count: u16,
        ) -> Result<Vec<u16>, TransportError> {
            self.calls.push((address, count));
            self.replies
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Read("no reply".to_string())))
        }

        async fn disconnect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn timeout() -> Result<Vec<u16>, TransportError> {
        Err(TransportError::Timeout(std::time::Duration::from_secs(1)))
    }

    fn plan(blocks: Vec<Block>, retries: u32) -> AcquisitionPlan {
        let schema = Schema::load(&[RegisterEntry::new(12, "last", "raw")]).unwrap();
        AcquisitionPlan::new(&schema, blocks, retries)
    }

    #[test]
    fn test_block_geometry() {
        let block = Block::new(600, 21);
        assert_eq!(block.end(), 621);
        assert!(block.contains(600));
        assert!(block.contains(620));
        assert!(!block.contains(621));
        assert!(!block.contains(599));
        assert_eq!(block.to_string(), "600..=620");

        assert!(block.overlaps(&Block::new(620, 5)));
        assert!(!block.overlaps(&Block::new(621, 5)));
        assert!(!block.overlaps(&Block::new(590, 10)));
        assert!(block.overlaps(&Block::new(590, 11)));
    }

    #[test]
    fn test_default_blocks() {
        let blocks = default_blocks();
        assert_eq!(blocks[0].to_string(), "600..=620");
        assert_eq!(blocks[1].to_string(), "700..=706");
    }

    #[test]
    fn test_array_len_covers_schema_and_blocks() {
        assert_eq!(plan(vec![Block::new(0, 4)], 3).array_len(), 13);
        assert_eq!(plan(vec![Block::new(10, 10)], 3).array_len(), 20);
        assert_eq!(plan(Vec::new(), 3).array_len(), 13);
    }

    #[tokio::test]
    async fn test_all_blocks_succeed() {
        let plan = plan(vec![Block::new(0, 2), Block::new(10, 3)], 3);
        let mut reader = ScriptedReader::new(vec![Ok(vec![1, 2]), Ok(vec![10, 11, 12])]);

        let acquisition = plan.acquire(&mut reader).await;

        assert!(acquisition.is_complete());
        assert_eq!(reader.calls, vec![(0, 2), (10, 3)]);
        assert_eq!(acquisition.registers.get(1), Some(2));
        assert_eq!(acquisition.registers.get(12), Some(12));
        // Gap between blocks stays unknown.
        assert_eq!(acquisition.registers.get(5), None);
        assert_eq!(acquisition.outcomes[0].attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let plan = plan(vec![Block::new(0, 2)], 3);
        let mut reader = ScriptedReader::new(vec![timeout(), timeout(), Ok(vec![5, 6])]);

        let acquisition = plan.acquire(&mut reader).await;

        assert_eq!(
            acquisition.outcomes[0],
            BlockOutcome {
                block: Block::new(0, 2),
                attempts: 3,
                status: BlockStatus::Success,
            }
        );
        assert_eq!(acquisition.registers.get(0), Some(5));
    }

    #[tokio::test]
    async fn test_exhausted_block_does_not_abort_cycle() {
        let plan = plan(vec![Block::new(0, 2), Block::new(10, 2)], 2);
        let mut reader = ScriptedReader::new(vec![timeout(), timeout(), Ok(vec![7, 8])]);

        let acquisition = plan.acquire(&mut reader).await;

        assert_eq!(reader.calls, vec![(0, 2), (0, 2), (10, 2)]);
        assert_eq!(acquisition.outcomes[0].status, BlockStatus::Exhausted);
        assert_eq!(acquisition.outcomes[0].attempts, 2);
        assert_eq!(acquisition.outcomes[1].status, BlockStatus::Success);
        assert_eq!(acquisition.registers.get(0), None);
        assert_eq!(acquisition.registers.get(1), None);
        assert_eq!(acquisition.registers.get(10), Some(7));
        assert_eq!(
            acquisition.failed_blocks().collect::<Vec<_>>(),
            vec![&Block::new(0, 2)]
        );
    }

    #[tokio::test]
    async fn test_short_reply_counts_as_failure() {
        let plan = plan(vec![Block::new(0, 3)], 2);
        let mut reader = ScriptedReader::new(vec![Ok(vec![1]), Ok(vec![1, 2, 3])]);

        let acquisition = plan.acquire(&mut reader).await;

        assert_eq!(acquisition.outcomes[0].attempts, 2);
        assert_eq!(acquisition.registers.get(2), Some(3));
    }

    #[tokio::test]
    async fn test_zero_retries_reads_nothing() {
        let plan = plan(vec![Block::new(0, 1)], 0);
        let mut reader = ScriptedReader::new(vec![Ok(vec![1])]);

        let acquisition = plan.acquire(&mut reader).await;

        assert!(reader.calls.is_empty());
        assert_eq!(acquisition.outcomes[0].status, BlockStatus::Exhausted);
    }

    #[test]
    fn test_unread() {
        let plan = plan(default_blocks(), 3);
        let acquisition = plan.unread();

        assert_eq!(acquisition.registers.len(), 707);
        assert_eq!(acquisition.registers.known_count(), 0);
        assert_eq!(acquisition.failed_blocks().count(), 2);
    }
}
