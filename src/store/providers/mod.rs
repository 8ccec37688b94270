mod jsonl;
mod memory;

pub use jsonl::JsonlEventStore;
pub use memory::MemoryEventStore;
