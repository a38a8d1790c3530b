//! Политика планирования.
//!
//! # Компоненты
//!
//! - **classes**: режимы, алгоритмы и классификация процессов
//! - **params**: пользовательские параметры (квант времени, порог памяти)
//! - **protection**: защищённые и системно-критичные процессы
//! - **mode**: правило приостановки для каждого режима
//! - **engine**: движок, превращающий снапшот в упорядоченные решения
//! - **pressure**: приостановка тяжёлых фоновых процессов при нехватке памяти

pub mod classes;
pub mod engine;
pub mod mode;
pub mod params;
pub mod pressure;
pub mod protection;
