fn main() {
    renderdesk_lib::run()
}
