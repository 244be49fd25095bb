// supernode/mod.rs

pub mod api;
pub mod register;
pub mod types;

pub use api::{HttpSupernodeApi, SupernodeApi};
pub use register::{RegisterResult, SupernodeRegister, SupernodeRegistrar};
pub use types::{
    PieceResult, PieceTask, PullPieceTaskRequest, PullPieceTaskResponse, TaskCode, TaskStatus,
};
