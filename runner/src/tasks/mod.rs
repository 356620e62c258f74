pub mod stroop;
