mod session;
mod spawn;
