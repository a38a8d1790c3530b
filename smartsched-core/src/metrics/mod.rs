//! Сбор метрик системы и процессов.
//!
//! # Компоненты
//!
//! - **system**: загрузка CPU, памяти и swap из /proc
//! - **process**: перечисление процессов и их сырых счётчиков
//! - **foreground**: определение процессов переднего плана (X11, терминал)

pub mod foreground;
pub mod process;
pub mod system;
