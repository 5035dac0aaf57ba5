use std::rc::Rc;

use capwire::capability::{Client, Promise, Request};
use capwire::private::capability::{ClientHook, ParamsHook, ResultsHook};
use capwire::{any_pointer, message, Error, ErrorKind, MessageSize};

struct Token(Rc<()>);

impl ClientHook for Token {
    fn add_ref(&self) -> Box<dyn ClientHook> {
        Box::new(Token(self.0.clone()))
    }
    fn new_call(&self, _: u64, _: u16, _: Option<MessageSize>) -> Request {
        unimplemented!()
    }
    fn call(
        &self,
        _: u64,
        _: u16,
        _: Box<dyn ParamsHook>,
        _: Box<dyn ResultsHook>,
    ) -> Promise<(), Error> {
        Promise::err(Error::unimplemented("token".into()))
    }
    fn get_brand(&self) -> usize {
        0
    }
    fn get_ptr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }
    fn get_resolved(&self) -> Option<Box<dyn ClientHook>> {
        None
    }
    fn when_more_resolved(&self) -> Option<Promise<Box<dyn ClientHook>, Error>> {
        None
    }
    fn when_resolved(&self) -> Promise<(), Error> {
        Promise::ok(())
    }
}

#[test]
fn capabilities_survive_into_reader() {
    let token = Rc::new(());
    let mut message = message::Builder::new_default();
    {
        let root: any_pointer::Builder = message.init_root().unwrap();
        let mut list: capwire::dynamic_list::Builder = root
            .initn_as_list(capwire::schema::Type::Capability, 2)
            .unwrap();
        for i in 0..2 {
            match list.reborrow().get(i).unwrap() {
                capwire::dynamic_value::Builder::Capability(mut slot) => {
                    slot.set_as_capability(Box::new(Token(token.clone())))
                }
                _ => panic!("expected a capability slot"),
            }
        }
    }
    // The same capability twice shares one table entry.
    assert_eq!(message.cap_table().len(), 1);
    assert_eq!(message.cap_table().refcount(0), 2);

    let reader = message.into_reader();
    let list = reader
        .get_root::<any_pointer::Reader>()
        .unwrap()
        .get_as_list(capwire::schema::Type::Capability)
        .unwrap();
    for element in list.iter() {
        let pointer = match element.unwrap() {
            capwire::dynamic_value::Reader::Capability(p) => p,
            _ => panic!("expected a capability"),
        };
        let client: Client = pointer.get_as_capability().unwrap();
        assert_eq!(client.hook.get_ptr(), Rc::as_ptr(&token) as usize);
    }
}

#[test]
fn clearing_a_pointer_releases_its_capability() {
    let token = Rc::new(());
    let mut message = message::Builder::new_default();
    {
        let mut root: any_pointer::Builder = message.init_root().unwrap();
        root.set_as_capability(Box::new(Token(token.clone())));
    }
    assert_eq!(Rc::strong_count(&token), 2);

    {
        let mut root: any_pointer::Builder = message.get_root().unwrap();
        root.clear();
    }
    assert_eq!(Rc::strong_count(&token), 1);
    assert_eq!(message.cap_table().refcount(0), 0);

    let root: any_pointer::Reader = message.get_root_as_reader().unwrap();
    let err = root.get_as_capability::<Client>().err().unwrap();
    assert_eq!(err.kind, ErrorKind::MessageContainsNullCapabilityPointer);
}
