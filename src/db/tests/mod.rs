mod close;
mod jobs;
mod migrations;
