pub mod joycon;
