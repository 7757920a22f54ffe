mod json;
pub use json::{PrettyJsonLayer, PrettyJsonService};
