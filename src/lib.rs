#![doc = include_str!("RUSTDOC.md")]

pub mod firestore;

#[cfg(test)]
pub mod test_support;
