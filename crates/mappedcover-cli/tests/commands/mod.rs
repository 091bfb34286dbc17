mod check_test;
mod remap_test;
mod simulate_test;
