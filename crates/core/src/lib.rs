pub mod enums;
pub mod error;
pub mod ids;
pub mod run;
pub mod settings;
pub mod time;
pub mod validate;

// 导出让外部使用
pub use enums::*;
pub use error::*;
pub use ids::*;
pub use run::*;
pub use settings::*;
pub use time::*;
pub use validate::*;
