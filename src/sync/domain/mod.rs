//! Pure building blocks: transaction parsing, coin selection and address
//! derivation. Nothing in here touches the network.

pub mod coin_select;
pub mod parsed_tx;
pub mod spk_tracker;
