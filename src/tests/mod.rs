mod args_tests;
mod kiosk_tests;
