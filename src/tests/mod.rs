

#[cfg(test)]
pub mod delay_tests;
