//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」です。store と broker の中身はこのクレートの
//! 責務ではなく、ここで定義した契約だけに依存します。
//!
//! - ObjectStore が source of truth（正本）
//! - Broker は配送チャネル（task_id のみ）

pub mod broker;
pub mod clock;
pub mod id_generator;
pub mod object_store;

pub use self::broker::{Broker, Delivery, DeliveryOutcome, Outcome, Resident, TaskChannel};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::object_store::{FileHandle, FileRef, FileWriter, ObjectStore};
