pub mod content;
pub mod events;
pub mod history;
pub mod ops;
pub mod position;
pub mod sheet;
pub mod world;
pub mod world_ops;

pub use content::SheetContent;
pub use position::{GridRect, Identity, Position};
pub use sheet::Sheet;
pub use world::WorldIndex;
pub use world_ops::{World, WorldOp};
