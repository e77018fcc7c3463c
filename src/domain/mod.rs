// Core market entities
pub mod asset;

// Domain-specific error taxonomy
pub mod errors;

// Bus and audit event payloads
pub mod events;

// Net-equity math for the margin watcher
pub mod margin;

// Conditional triggers and P2P match planning
pub mod matching;

// Orders and queue instructions
pub mod order;

// Per-fill settlement math
pub mod settlement;

// Shared enums and constants
pub mod types;
