pub mod helper;

#[cfg(test)]
mod test_basic;
#[cfg(test)]
mod test_error;
#[cfg(test)]
mod test_lifecycle;
